//! Drift correction strategy
//!
//! Two strategies exist: SpeedToSync changes the playback rate for a short
//! window so the player catches up smoothly, SkipToSync seeks straight to the
//! estimated group position. Rate changes are reserved for moderate drift;
//! above `max_delay_speed_to_sync` the rate would have to be absurd.

use crate::config::SyncSettings;

/// Lowest playback rate SpeedToSync may use
pub const MIN_SPEED: f64 = 0.2;

/// Consecutive SpeedToSync attempts before falling back to SkipToSync
pub const MAX_SPEED_ATTEMPTS: u32 = 3;

/// Consecutive attempts without reaching sync before corrections are suspended
pub const MAX_SYNC_ATTEMPTS: u32 = 5;

/// What to do about a measured drift
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Close enough
    InSync,
    /// Play at `rate` for `duration_ms`, then back to 1.0
    SpeedToSync { rate: f64, duration_ms: f64 },
    /// Seek to the estimated group position
    SkipToSync,
}

/// Pick a correction for `diff_ms` (group position minus local position).
///
/// `attempts` is the number of consecutive corrections already made.
pub fn plan_correction(diff_ms: f64, settings: &SyncSettings, has_playback_rate: bool, attempts: u32) -> Correction {
    let abs_diff = diff_ms.abs();

    let speed_allowed = has_playback_rate && settings.use_speed_to_sync && attempts < MAX_SPEED_ATTEMPTS;

    if speed_allowed
        && abs_diff >= settings.min_delay_speed_to_sync
        && abs_diff < settings.max_delay_speed_to_sync
    {
        let mut duration_ms = settings.speed_to_sync_duration;
        // Far ahead of the group: stretch the window instead of going below MIN_SPEED
        if diff_ms <= -duration_ms * MIN_SPEED {
            duration_ms = abs_diff / (1.0 - MIN_SPEED);
        }

        return Correction::SpeedToSync {
            rate: 1.0 + diff_ms / duration_ms,
            duration_ms,
        };
    }

    if settings.use_skip_to_sync && abs_diff >= settings.min_delay_skip_to_sync {
        return Correction::SkipToSync;
    }

    Correction::InSync
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_low_threshold_is_in_sync() {
        let settings = SyncSettings::default();
        assert_eq!(plan_correction(30.0, &settings, true, 0), Correction::InSync);
        assert_eq!(plan_correction(-59.0, &settings, true, 0), Correction::InSync);
    }

    #[test]
    fn test_moderate_drift_uses_rate() {
        let settings = SyncSettings::default();
        assert_eq!(
            plan_correction(500.0, &settings, true, 0),
            Correction::SpeedToSync { rate: 1.5, duration_ms: 1000.0 }
        );
    }

    #[test]
    fn test_far_ahead_stretches_window() {
        let settings = SyncSettings::default();
        match plan_correction(-800.0, &settings, true, 0) {
            Correction::SpeedToSync { rate, duration_ms } => {
                assert!((duration_ms - 1000.0).abs() < 1e-6);
                assert!((rate - 0.2).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }

        match plan_correction(-2000.0, &settings, true, 0) {
            Correction::SpeedToSync { rate, duration_ms } => {
                assert!((duration_ms - 2500.0).abs() < 1e-6);
                assert!((rate - MIN_SPEED).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_large_drift_seeks() {
        let settings = SyncSettings::default();
        assert_eq!(plan_correction(3500.0, &settings, true, 0), Correction::SkipToSync);
    }

    #[test]
    fn test_without_rate_control() {
        let settings = SyncSettings::default();
        // Between the rate and seek thresholds there is nothing to do
        assert_eq!(plan_correction(200.0, &settings, false, 0), Correction::InSync);
        assert_eq!(plan_correction(450.0, &settings, false, 0), Correction::SkipToSync);
    }

    #[test]
    fn test_repeated_speed_attempts_fall_back_to_skip() {
        let settings = SyncSettings::default();
        assert_eq!(
            plan_correction(500.0, &settings, true, MAX_SPEED_ATTEMPTS),
            Correction::SkipToSync
        );
    }

    #[test]
    fn test_strategies_can_be_disabled() {
        let mut settings = SyncSettings::default();
        settings.use_skip_to_sync = false;
        assert_eq!(plan_correction(5000.0, &settings, true, 0), Correction::InSync);
    }
}
