//! Sync settings
//!
//! User-tunable thresholds used by the scheduler, the dispatcher and the
//! session orchestrator. These are the only values that survive a restart;
//! they are stored as camelCase JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Errors loading or saving settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown sync profile: {0}")]
    UnknownProfile(String),
}

/// Preset threshold bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncProfile {
    /// Slower to react, tolerant of jittery networks and slow players
    Conservative,
    /// Default thresholds
    Balanced,
    /// Tight sync for fast local players on good networks
    Aggressive,
    /// Thresholds edited by hand
    Custom,
}

impl SyncProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncProfile::Conservative => "conservative",
            SyncProfile::Balanced => "balanced",
            SyncProfile::Aggressive => "aggressive",
            SyncProfile::Custom => "custom",
        }
    }
}

impl std::str::FromStr for SyncProfile {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(SyncProfile::Conservative),
            "balanced" => Ok(SyncProfile::Balanced),
            "aggressive" => Ok(SyncProfile::Aggressive),
            "custom" => Ok(SyncProfile::Custom),
            other => Err(SettingsError::UnknownProfile(other.to_string())),
        }
    }
}

/// All tunable sync thresholds. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Profile the thresholds were last taken from
    pub profile: SyncProfile,
    /// Manual offset added on top of the measured clock offset
    pub extra_time_offset: f64,
    /// Master switch for drift correction while playing
    pub enable_sync_correction: bool,
    /// Allow playback-rate based correction
    pub use_speed_to_sync: bool,
    /// Allow seek based correction
    pub use_skip_to_sync: bool,
    /// Drift below this is considered in sync
    pub min_delay_speed_to_sync: f64,
    /// Drift above this is too large for rate correction
    pub max_delay_speed_to_sync: f64,
    /// Time window over which a rate correction closes the drift
    pub speed_to_sync_duration: f64,
    /// Drift above this triggers a seek when rate correction is not possible
    pub min_delay_skip_to_sync: f64,
    /// An unpause arriving later than this is applied as seek + unpause
    pub max_late_command_millis: f64,
    /// How long a seek waits for the player to report ready
    pub seek_ready_event_timeout_ms: u64,
    /// Minimum spacing between outbound transport requests
    pub command_cooldown_ms: u64,
    /// Buffering shorter than this is not worth a notice
    pub buffering_threshold_millis: u64,
    /// Refuse to send unpause while the group waits for members to be ready
    pub enforce_ready_before_unpause: bool,
    /// Interval between authoritative joined-state fetches
    pub reconcile_interval_ms: u64,
    /// Grace window before an unconfirmed membership loss disables the session
    pub disable_grace_millis: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let mut settings = Self {
            profile: SyncProfile::Balanced,
            extra_time_offset: 0.0,
            enable_sync_correction: true,
            use_speed_to_sync: true,
            use_skip_to_sync: true,
            min_delay_speed_to_sync: 0.0,
            max_delay_speed_to_sync: 0.0,
            speed_to_sync_duration: 0.0,
            min_delay_skip_to_sync: 0.0,
            max_late_command_millis: 0.0,
            seek_ready_event_timeout_ms: 0,
            command_cooldown_ms: 0,
            buffering_threshold_millis: 0,
            enforce_ready_before_unpause: true,
            reconcile_interval_ms: 10_000,
            disable_grace_millis: 2_500,
        };
        settings.apply_profile(SyncProfile::Balanced);
        settings
    }
}

impl SyncSettings {
    /// Settings tuned with the given profile
    pub fn with_profile(profile: SyncProfile) -> Self {
        let mut settings = Self::default();
        settings.apply_profile(profile);
        settings
    }

    /// Overwrite the tuned thresholds with a preset. `Custom` keeps the
    /// current values and only records the profile.
    pub fn apply_profile(&mut self, profile: SyncProfile) {
        // (minSpeed, maxSpeed, speedDuration, minSkip, maxLate, seekReady, cooldown, buffering)
        let preset = match profile {
            SyncProfile::Conservative => (90.0, 3600.0, 1400.0, 700.0, 1600.0, 1700, 220, 2300),
            SyncProfile::Balanced => (60.0, 3000.0, 1000.0, 400.0, 1200.0, 1200, 140, 1800),
            SyncProfile::Aggressive => (40.0, 2200.0, 700.0, 250.0, 900.0, 900, 90, 1200),
            SyncProfile::Custom => {
                self.profile = profile;
                return;
            }
        };

        self.min_delay_speed_to_sync = preset.0;
        self.max_delay_speed_to_sync = preset.1;
        self.speed_to_sync_duration = preset.2;
        self.min_delay_skip_to_sync = preset.3;
        self.max_late_command_millis = preset.4;
        self.seek_ready_event_timeout_ms = preset.5;
        self.command_cooldown_ms = preset.6;
        self.buffering_threshold_millis = preset.7;
        self.profile = profile;
    }

    /// Delay after a transport change before corrections are armed, and the
    /// cooldown between two correction attempts.
    pub fn sync_grace_ms(&self) -> u64 {
        (self.max_delay_speed_to_sync / 2.0).max(0.0) as u64
    }

    /// Load settings from a JSON file, falling back to defaults for missing fields
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let settings: SyncSettings = serde_json::from_str(&raw)?;
        debug!("Loaded sync settings from {} (profile={})", path.display(), settings.profile.as_str());
        Ok(settings)
    }

    /// Load settings if the file exists, otherwise return defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Saved sync settings to {}", path.display());
        Ok(())
    }
}
