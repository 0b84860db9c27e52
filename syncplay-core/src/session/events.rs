//! Events published by a running session

use std::fmt;
use tokio::sync::broadcast;

use crate::player::PlayerKind;
use crate::service::GroupState;

/// Buffered events per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// Correction strategy currently in effect
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncMethod {
    /// No correction running
    None,
    SpeedToSync { rate: f64 },
    SkipToSync { attempt: u32 },
    /// Corrections suspended after repeated failures
    Disabled,
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMethod::None => Ok(()),
            SyncMethod::SpeedToSync { rate } => write!(f, "SpeedToSync (x{:.2})", rate),
            SyncMethod::SkipToSync { attempt } => write!(f, "SkipToSync ({})", attempt),
            SyncMethod::Disabled => write!(f, "Sync disabled"),
        }
    }
}

/// Transient on-screen cues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsdCue {
    Unpause,
    Pause,
    Seek,
    Buffering,
    /// Waiting for the group before pausing
    WaitPause,
    /// Waiting for the group before unpausing
    WaitUnpause,
}

/// User-facing notices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    GroupJoined(String),
    GroupLeft,
    UserJoined(String),
    UserLeft(String),
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
    SyncPlayDisabled,
    /// Unpause refused while the group waits for members
    WaitingForGroup,
    /// The local player could not play the group's media
    PlaybackFailed(String),
    /// This client stopped following the group
    FollowingHalted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Enabled { group_id: String, group_name: String },
    Disabled,
    PlayerChanged(PlayerKind),
    /// Group position minus local position, in milliseconds
    PlaybackDiff(f64),
    SyncMethod(SyncMethod),
    GroupStateChanged { state: GroupState, reason: String },
    Osd(OsdCue),
    Notice(Notice),
    ClockUpdated { offset_ms: f64, ping_ms: f64 },
    QueueChanged { entries: usize, current: Option<String> },
    Error(String),
}

/// Fan-out of session events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish; events with no subscriber are dropped
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
