//! Sync metrics tracked by the monitor

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use syncplay_core::service::GroupState;
use syncplay_core::session::{Notice, OsdCue, SyncMethod};
use syncplay_core::{Phase, PlayerKind, SessionEvent, SessionSnapshot};

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Group,
    Sync,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Group => "GROUP",
            LogLevel::Sync => "SYNC",
        }
    }
}

/// Session metrics, refreshed from events and periodic snapshots
pub struct Metrics {
    pub start_time: DateTime<Local>,

    /// Service base URL
    pub server: String,

    pub phase: Phase,
    pub following: bool,

    pub group_name: Option<String>,
    pub group_state: Option<GroupState>,
    pub revision: Option<u64>,
    pub participants: Vec<String>,
    pub queue_len: usize,
    pub current_item: Option<String>,

    pub offset_ms: f64,
    pub ping_ms: f64,
    pub clock_samples: usize,

    pub player: PlayerKind,
    /// Local position of the simulated player
    pub position_ms: f64,
    pub playback_diff_ms: f64,
    /// Largest absolute drift seen while playing
    pub peak_diff_ms: f64,
    pub sync_method: SyncMethod,
    /// Corrections applied since start
    pub corrections: u64,

    pub logs: VecDeque<LogEntry>,
}

impl Metrics {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            start_time: Local::now(),
            server: server.into(),
            phase: Phase::Disabled,
            following: true,
            group_name: None,
            group_state: None,
            revision: None,
            participants: Vec::new(),
            queue_len: 0,
            current_item: None,
            offset_ms: 0.0,
            ping_ms: 0.0,
            clock_samples: 0,
            player: PlayerKind::NoActive,
            position_ms: 0.0,
            playback_diff_ms: 0.0,
            peak_diff_ms: 0.0,
            sync_method: SyncMethod::None,
            corrections: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Fold a session event into the counters and the log
    pub fn apply_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Enabled { group_name, .. } => {
                self.group_name = Some(group_name.clone());
                self.peak_diff_ms = 0.0;
                self.corrections = 0;
            }
            SessionEvent::Disabled => {
                self.phase = Phase::Disabled;
                self.group_name = None;
                self.group_state = None;
                self.participants.clear();
                self.sync_method = SyncMethod::None;
            }
            SessionEvent::PlayerChanged(kind) => self.player = *kind,
            SessionEvent::PlaybackDiff(diff) => {
                self.playback_diff_ms = *diff;
                if diff.abs() > self.peak_diff_ms {
                    self.peak_diff_ms = diff.abs();
                }
            }
            SessionEvent::SyncMethod(method) => {
                if matches!(method, SyncMethod::SpeedToSync { .. } | SyncMethod::SkipToSync { .. }) {
                    self.corrections += 1;
                }
                self.sync_method = *method;
            }
            SessionEvent::GroupStateChanged { state, .. } => self.group_state = Some(*state),
            SessionEvent::ClockUpdated { offset_ms, ping_ms } => {
                self.offset_ms = *offset_ms;
                self.ping_ms = *ping_ms;
            }
            SessionEvent::QueueChanged { entries, current } => {
                self.queue_len = *entries;
                self.current_item = current.clone();
            }
            SessionEvent::Notice(Notice::FollowingHalted) => self.following = false,
            SessionEvent::Osd(_) | SessionEvent::Notice(_) | SessionEvent::Error(_) => {}
        }

        if let Some((level, message)) = describe(event) {
            self.log(level, message);
        }
    }

    /// Overwrite the view with the session's own state
    pub fn apply_snapshot(&mut self, snapshot: &SessionSnapshot) {
        self.phase = snapshot.phase;
        self.following = snapshot.following;
        self.group_name = snapshot.group_name.clone();
        self.group_state = snapshot.group_state;
        self.revision = snapshot.revision;
        self.participants = snapshot.participants.clone();
        self.queue_len = snapshot.queue_len;
        self.current_item = snapshot.current_item.clone();
        self.offset_ms = snapshot.offset_ms;
        self.ping_ms = snapshot.ping_ms;
        self.clock_samples = snapshot.clock_samples;
        self.player = snapshot.player;
        self.playback_diff_ms = snapshot.playback_diff_ms;
        self.sync_method = snapshot.sync_method;
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Log line for an event. Frequent events (drift samples, transport cues) have none.
pub fn describe(event: &SessionEvent) -> Option<(LogLevel, String)> {
    let line = match event {
        SessionEvent::Enabled { group_name, .. } => (LogLevel::Group, format!("Sync enabled for {}", group_name)),
        SessionEvent::Disabled => (LogLevel::Group, "Sync disabled".to_string()),
        SessionEvent::PlayerChanged(kind) => (LogLevel::Info, format!("Player bound: {}", kind.as_str())),
        SessionEvent::SyncMethod(SyncMethod::None) => return None,
        SessionEvent::SyncMethod(method) => (LogLevel::Sync, method.to_string()),
        SessionEvent::GroupStateChanged { state, reason } => {
            (LogLevel::Group, format!("Group {} ({})", state.as_str(), reason))
        }
        SessionEvent::QueueChanged { entries, current } => (
            LogLevel::Info,
            format!("Queue: {} items, playing {}", entries, current.as_deref().unwrap_or("nothing")),
        ),
        SessionEvent::Notice(notice) => notice_line(notice),
        SessionEvent::Error(message) => (LogLevel::Error, message.clone()),
        SessionEvent::Osd(OsdCue::Buffering) => (LogLevel::Warning, "Player buffering".to_string()),
        SessionEvent::Osd(OsdCue::WaitPause) => (LogLevel::Group, "Waiting for the group to pause".to_string()),
        SessionEvent::Osd(OsdCue::WaitUnpause) => (LogLevel::Group, "Waiting for the group to play".to_string()),
        SessionEvent::PlaybackDiff(_) | SessionEvent::Osd(_) | SessionEvent::ClockUpdated { .. } => return None,
    };
    Some(line)
}

fn notice_line(notice: &Notice) -> (LogLevel, String) {
    match notice {
        Notice::GroupJoined(name) => (LogLevel::Group, format!("Joined {}", name)),
        Notice::GroupLeft => (LogLevel::Group, "Left the group".to_string()),
        Notice::UserJoined(user) => (LogLevel::Group, format!("{} joined", user)),
        Notice::UserLeft(user) => (LogLevel::Group, format!("{} left", user)),
        Notice::GroupDoesNotExist => (LogLevel::Warning, "Group does not exist".to_string()),
        Notice::CreateGroupDenied => (LogLevel::Warning, "Not allowed to create groups".to_string()),
        Notice::JoinGroupDenied => (LogLevel::Warning, "Not allowed to join groups".to_string()),
        Notice::LibraryAccessDenied => (LogLevel::Warning, "No access to the group's library".to_string()),
        Notice::SyncPlayDisabled => (LogLevel::Warning, "Group playback is disabled for this user".to_string()),
        Notice::WaitingForGroup => (LogLevel::Info, "Waiting for the group".to_string()),
        Notice::PlaybackFailed(reason) => (LogLevel::Error, format!("Playback failed: {}", reason)),
        Notice::FollowingHalted => (LogLevel::Warning, "Stopped following the group".to_string()),
    }
}
