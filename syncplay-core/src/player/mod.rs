//! Local player adapter contract
//!
//! A media engine backend implements [`LocalPlayer`]. Optional capabilities
//! default to [`PlayerError::FeatureNotSupported`] so adapters only override
//! what their engine can do. Notifications flow back into the session as
//! [`PlayerEvent`]s through a [`PlayerEventSink`].

mod registry;

pub use registry::{new_shared_registry, NoActivePlayer, PlayerKind, PlayerRegistry, SharedPlayerRegistry};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::queue::QueueEntry;
use crate::service::{RepeatMode, ShuffleMode};
use crate::time::{Millis, Ticks};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlayerError {
    #[error("Feature not supported by this player")]
    FeatureNotSupported,

    #[error("No active player")]
    NoActivePlayer,

    #[error("Player error: {0}")]
    Engine(String),
}

/// What to start playing
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub entries: Vec<QueueEntry>,
    pub start_index: usize,
    pub start_position_ticks: Ticks,
}

/// Notifications from the local player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Enough data buffered to play
    Ready,
    /// Stalled waiting for data
    Buffering,
    /// A new item started playing
    PlaybackStart,
    /// Playback stopped
    PlaybackStop,
    Pause,
    Unpause,
    /// Position report, in milliseconds into the current item
    TimeUpdate { position_ms: f64 },
    /// The engine failed to play
    PlaybackError(String),
}

/// Channel the adapter uses to report events to the session
#[derive(Clone)]
pub struct PlayerEventSink {
    tx: mpsc::UnboundedSender<PlayerEvent>,
}

impl PlayerEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PlayerEvent>) -> Self {
        Self { tx }
    }

    /// Sink paired with the receiving end, for driving an adapter on its own
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an event. Returns false once the session is gone.
    pub fn emit(&self, event: PlayerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Capabilities the sync engine needs from a media engine
#[async_trait]
pub trait LocalPlayer: Send + Sync {
    /// Variant this adapter implements
    fn kind(&self) -> PlayerKind;

    /// Whether something is loaded (playing or paused)
    fn is_playback_active(&self) -> bool;

    fn is_playing(&self) -> bool;

    /// Players with their own group client are never driven by the scheduler
    fn is_remote(&self) -> bool {
        false
    }

    /// Current position in milliseconds
    async fn current_time(&self) -> Result<Millis, PlayerError>;

    fn has_playback_rate(&self) -> bool {
        false
    }

    async fn set_playback_rate(&self, _rate: f64) -> Result<(), PlayerError> {
        Err(PlayerError::FeatureNotSupported)
    }

    async fn local_play(&self, request: PlayRequest) -> Result<(), PlayerError>;

    async fn local_pause(&self) -> Result<(), PlayerError>;

    async fn local_unpause(&self) -> Result<(), PlayerError>;

    async fn local_seek(&self, position_ticks: Ticks) -> Result<(), PlayerError>;

    async fn local_stop(&self) -> Result<(), PlayerError>;

    async fn local_set_current_playlist_item(&self, _playlist_item_id: &str) -> Result<(), PlayerError> {
        Err(PlayerError::FeatureNotSupported)
    }

    async fn local_set_repeat_mode(&self, _mode: RepeatMode) -> Result<(), PlayerError> {
        Err(PlayerError::FeatureNotSupported)
    }

    async fn local_set_shuffle_mode(&self, _mode: ShuffleMode) -> Result<(), PlayerError> {
        Err(PlayerError::FeatureNotSupported)
    }

    /// The queue changed without affecting what plays; refresh any view of it
    async fn on_queue_update(&self) -> Result<(), PlayerError> {
        Ok(())
    }
}
