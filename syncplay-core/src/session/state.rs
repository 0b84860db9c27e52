//! Session bookkeeping

use crate::player::PlayerKind;
use crate::service::{GroupInfo, GroupState, PlaybackCommand};
use crate::time::Millis;

use super::events::SyncMethod;

/// Lifecycle of a group session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Not in a group
    #[default]
    Disabled,
    /// Joined, waiting for the first clock estimate; commands are held back
    Enabling,
    /// Joined and synchronized
    Ready,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Disabled => "disabled",
            Phase::Enabling => "enabling",
            Phase::Ready => "ready",
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self != Phase::Disabled
    }
}

/// Mutable state of the session task
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub phase: Phase,
    pub group: Option<GroupInfo>,
    /// Commands emitted before this service time belong to an earlier session
    pub enabled_at: Millis,
    pub latest_revision: Option<u64>,
    /// Whether local playback follows the group
    pub following: bool,
    /// Command held back until the clock converges
    pub queued_command: Option<PlaybackCommand>,
    /// Command held back until the queue being resolved is applied
    pub deferred_command: Option<PlaybackCommand>,
    /// Last command received for this group, applied or not
    pub last_playback_command: Option<PlaybackCommand>,
    /// Generation of the queue update being resolved
    pub queue_resolving: Option<u64>,
    pub queue_generation: u64,
    /// Resume group playback once the queue being resolved is applied
    pub pending_resume: bool,
    /// Waiting for the player to report a started item
    pub awaiting_playback_start: bool,
    /// Consecutive playback errors
    pub playback_errors: u32,
}

impl SessionState {
    pub fn group_id(&self) -> Option<&str> {
        self.group.as_ref().map(|g| g.group_id.as_str())
    }

    pub fn group_state(&self) -> Option<GroupState> {
        self.group.as_ref().map(|g| g.state)
    }

    /// Back to a blank disabled session, keeping the queue generation
    /// counter so in-flight resolutions of the old session are recognised.
    pub fn reset(&mut self) {
        let queue_generation = self.queue_generation;
        *self = Self::default();
        self.queue_generation = queue_generation;
    }
}

/// Point-in-time view of a session for observers
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub group_state: Option<GroupState>,
    pub participants: Vec<String>,
    pub revision: Option<u64>,
    pub following: bool,
    pub player: PlayerKind,
    pub queue_len: usize,
    pub current_item: Option<String>,
    pub offset_ms: f64,
    pub ping_ms: f64,
    pub clock_samples: usize,
    pub playback_diff_ms: f64,
    pub sync_method: SyncMethod,
}
