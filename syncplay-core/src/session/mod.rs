//! Group session orchestration
//!
//! A session runs as one task that owns the clock estimate, the scheduler,
//! the queue and the dispatcher. Everything reaches it as a message: calls on
//! [`SessionHandle`], player events, probe results, timer fires. Observers
//! follow it through [`SessionEvent`]s.

mod actor;
mod context;
mod events;
mod outbound;
mod state;
mod timers;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{EventBus, Notice, OsdCue, SessionEvent, SyncMethod};
pub use state::{Phase, SessionSnapshot};

pub(crate) use context::SessionContext;
pub(crate) use timers::TimerKey;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::SyncSettings;
use crate::controller::ControlRequest;
use crate::player::{LocalPlayer, PlayerEvent, PlayerEventSink, PlayerKind, SharedPlayerRegistry};
use crate::service::{GroupService, GroupUpdate, PlaybackCommand, QueueMode, RepeatMode, ShuffleMode};
use crate::time::{LocalClock, Ticks};

use actor::SessionActor;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session task closed")]
    Closed,

    #[error("Service error: {0}")]
    Service(String),
}

/// Messages from the handle to the session task
#[derive(Debug)]
pub(crate) enum SessionCommand {
    GroupUpdate(GroupUpdate),
    PlaybackCommand(PlaybackCommand),
    Control(ControlRequest),
    BindPlayer(Option<PlayerKind>),
    FollowGroup,
    HaltGroup,
    ResumeGroup,
    Leave,
    UpdateSettings(SyncSettings),
    RefreshClock,
    RefreshJoinedState {
        allow_enable: bool,
        respond: oneshot::Sender<Result<bool, SessionError>>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    player_tx: mpsc::UnboundedSender<PlayerEvent>,
    registry: SharedPlayerRegistry,
    events: EventBus,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.command_tx.send(command).map_err(|_| SessionError::Closed)
    }

    fn control(&self, request: ControlRequest) -> Result<(), SessionError> {
        self.send(SessionCommand::Control(request))
    }

    /// Deliver a group update pushed by the service
    pub fn group_update(&self, update: GroupUpdate) -> Result<(), SessionError> {
        self.send(SessionCommand::GroupUpdate(update))
    }

    /// Deliver a playback command pushed by the service
    pub fn playback_command(&self, command: PlaybackCommand) -> Result<(), SessionError> {
        self.send(SessionCommand::PlaybackCommand(command))
    }

    /// Sink for a player adapter to report its events through
    pub fn player_events(&self) -> PlayerEventSink {
        PlayerEventSink::new(self.player_tx.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Make an adapter available for binding
    pub fn register_player(&self, player: Arc<dyn LocalPlayer>) {
        self.registry.write().register(player);
    }

    pub fn bind_player(&self, kind: PlayerKind) -> Result<(), SessionError> {
        self.send(SessionCommand::BindPlayer(Some(kind)))
    }

    pub fn release_player(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::BindPlayer(None))
    }

    pub fn unpause(&self) -> Result<(), SessionError> {
        self.control(ControlRequest::Unpause)
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.control(ControlRequest::Pause)
    }

    pub fn seek(&self, position_ticks: Ticks) -> Result<(), SessionError> {
        self.control(ControlRequest::Seek(position_ticks))
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.control(ControlRequest::Stop)
    }

    pub fn set_new_queue(
        &self,
        item_ids: Vec<String>,
        start_index: usize,
        start_position_ticks: Ticks,
    ) -> Result<(), SessionError> {
        self.control(ControlRequest::SetNewQueue {
            item_ids,
            start_index,
            start_position_ticks,
        })
    }

    pub fn queue(&self, item_ids: Vec<String>) -> Result<(), SessionError> {
        self.control(ControlRequest::Queue {
            item_ids,
            mode: QueueMode::Queue,
        })
    }

    pub fn queue_next(&self, item_ids: Vec<String>) -> Result<(), SessionError> {
        self.control(ControlRequest::Queue {
            item_ids,
            mode: QueueMode::QueueNext,
        })
    }

    pub fn remove_from_playlist(&self, playlist_item_ids: Vec<String>) -> Result<(), SessionError> {
        self.control(ControlRequest::RemoveFromPlaylist(playlist_item_ids))
    }

    pub fn move_playlist_item(&self, playlist_item_id: &str, new_index: usize) -> Result<(), SessionError> {
        self.control(ControlRequest::MovePlaylistItem {
            playlist_item_id: playlist_item_id.to_string(),
            new_index,
        })
    }

    pub fn set_current_item(&self, playlist_item_id: &str) -> Result<(), SessionError> {
        self.control(ControlRequest::SetCurrentItem(playlist_item_id.to_string()))
    }

    pub fn next_item(&self) -> Result<(), SessionError> {
        self.control(ControlRequest::NextItem)
    }

    pub fn previous_item(&self) -> Result<(), SessionError> {
        self.control(ControlRequest::PreviousItem)
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) -> Result<(), SessionError> {
        self.control(ControlRequest::SetRepeatMode(mode))
    }

    pub fn set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), SessionError> {
        self.control(ControlRequest::SetShuffleMode(mode))
    }

    pub fn toggle_shuffle(&self) -> Result<(), SessionError> {
        self.control(ControlRequest::ToggleShuffle)
    }

    /// Tell the group to wait for this client again
    pub fn follow_group_playback(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::FollowGroup)
    }

    /// Stop local playback and let the group go on without this client
    pub fn halt_group_playback(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::HaltGroup)
    }

    /// Follow again and restart local playback from the group queue
    pub fn resume_group_playback(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ResumeGroup)
    }

    pub fn leave(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Leave)
    }

    pub fn update_settings(&self, settings: SyncSettings) -> Result<(), SessionError> {
        self.send(SessionCommand::UpdateSettings(settings))
    }

    /// Restart the greedy clock phase
    pub fn refresh_clock(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::RefreshClock)
    }

    /// Fetch the joined state from the service and apply it.
    ///
    /// Returns whether this client is a member. With `allow_enable` a
    /// disabled session joins the group it turns out to be in.
    pub async fn refresh_joined_state(&self, allow_enable: bool) -> Result<bool, SessionError> {
        let (respond, rx) = oneshot::channel();
        self.send(SessionCommand::RefreshJoinedState { allow_enable, respond })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown);
    }
}

/// Session builder
pub struct Session {
    settings: SyncSettings,
    service: Arc<dyn GroupService>,
    registry: SharedPlayerRegistry,
    clock: Option<LocalClock>,
}

impl Session {
    pub fn new(settings: SyncSettings, service: Arc<dyn GroupService>, registry: SharedPlayerRegistry) -> Self {
        Self {
            settings,
            service,
            registry,
            clock: None,
        }
    }

    /// Use a specific local clock instead of the system one
    pub fn with_clock(mut self, clock: LocalClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Spawn the session task and return a handle for communication
    pub fn start(self) -> (SessionHandle, broadcast::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (player_tx, player_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();
        let event_rx = events.subscribe();

        let handle = SessionHandle {
            command_tx,
            player_tx,
            registry: self.registry.clone(),
            events: events.clone(),
        };

        let clock = self.clock.unwrap_or_default();
        let (actor, inbox) = SessionActor::new(self.settings, self.service, self.registry, clock, events);
        tokio::spawn(actor.run(inbox, command_rx, player_rx));

        (handle, event_rx)
    }
}
