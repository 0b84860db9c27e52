//! The session task

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::context::SessionContext;
use super::events::{EventBus, Notice, OsdCue, SessionEvent};
use super::outbound::{Outbound, RequestFailure};
use super::state::{Phase, SessionSnapshot, SessionState};
use super::timers::{TimerFired, TimerKey, Timers};
use super::{SessionCommand, SessionError};
use crate::clock::{ClockPoller, ClockSync, Measurement};
use crate::config::SyncSettings;
use crate::controller::{Controller, DispatchView};
use crate::playback::{estimate_current_ticks, local_op, LocalOp, PlaybackCore};
use crate::player::{PlayRequest, PlayerEvent, PlayerKind, SharedPlayerRegistry};
use crate::queue::{QueueAction, QueueCore};
use crate::service::{
    CommandKind, GroupInfo, GroupService, GroupSnapshot, GroupState, GroupUpdate, JoinedState, MediaItem,
    PlayQueueUpdate, PlaybackCommand, ServiceError, ServiceRequest,
};
use crate::time::{LocalClock, Ticks, TICKS_PER_MS};

/// How long to wait for the player to start an item
pub const PLAYBACK_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive playback errors before the client stops following the group
pub const MAX_PLAYBACK_ERRORS: u32 = 3;

/// Results of work the session spawned
#[derive(Debug)]
pub(crate) enum Internal {
    Probe(Result<Measurement, ServiceError>),
    QueueResolved {
        generation: u64,
        update: PlayQueueUpdate,
        result: Result<Vec<MediaItem>, ServiceError>,
    },
    JoinedFetched(Result<JoinedState, ServiceError>),
}

/// Why a joined-state fetch was started
#[derive(Debug)]
enum FetchReason {
    /// Periodic check
    Reconcile,
    /// Membership looked lost
    Rehydrate,
    /// Asked for through the handle
    Caller {
        allow_enable: bool,
        respond: oneshot::Sender<Result<bool, SessionError>>,
    },
}

/// Receivers the session task listens on besides the handle
pub(crate) struct Inbox {
    internal: mpsc::UnboundedReceiver<Internal>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    failures: mpsc::UnboundedReceiver<RequestFailure>,
}

pub(crate) struct SessionActor {
    ctx: SessionContext,
    state: SessionState,
    playback: PlaybackCore,
    queue: QueueCore,
    controller: Controller,
    poller: ClockPoller,
    service: Arc<dyn GroupService>,
    registry: SharedPlayerRegistry,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Callers sharing the joined-state fetch in flight
    joined_fetch: Option<Vec<FetchReason>>,
}

impl SessionActor {
    pub fn new(
        settings: SyncSettings,
        service: Arc<dyn GroupService>,
        registry: SharedPlayerRegistry,
        local: LocalClock,
        events: EventBus,
    ) -> (Self, Inbox) {
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (failure_tx, failures) = mpsc::unbounded_channel();

        let mut clock = ClockSync::new();
        clock.set_extra_offset(settings.extra_time_offset);
        let player = registry.read().resolve(None);

        let ctx = SessionContext {
            player,
            clock,
            local,
            settings,
            timers: Timers::new(timer_tx),
            events,
            outbound: Outbound::start(service.clone(), failure_tx),
        };

        let actor = Self {
            ctx,
            state: SessionState::default(),
            playback: PlaybackCore::new(),
            queue: QueueCore::new(),
            controller: Controller::new(),
            poller: ClockPoller::new(),
            service,
            registry,
            internal_tx,
            joined_fetch: None,
        };

        (
            actor,
            Inbox {
                internal,
                timers,
                failures,
            },
        )
    }

    pub async fn run(
        mut self,
        mut inbox: Inbox,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut player_events: mpsc::UnboundedReceiver<PlayerEvent>,
    ) {
        info!("Session task started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(message) = inbox.internal.recv() => self.handle_internal(message).await,
                Some(fired) = inbox.timers.recv() => {
                    if self.ctx.timers.take(fired) {
                        self.on_timer(fired.key).await;
                    }
                }
                Some(failure) = inbox.failures.recv() => {
                    self.ctx.emit(SessionEvent::Error(format!(
                        "{} request failed: {}",
                        failure.request, failure.error
                    )));
                }
                Some(event) = player_events.recv() => self.on_player_event(event).await,
            }
        }

        self.disable(false).await;
        info!("Session task stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::GroupUpdate(update) => self.on_group_update(update).await,
            SessionCommand::PlaybackCommand(command) => self.process_command(command).await,
            SessionCommand::Control(request) => {
                if !self.state.phase.is_enabled() {
                    debug!("Ignoring {:?}: not in a group", request);
                    return;
                }
                let view = DispatchView {
                    group_state: self.state.group_state(),
                    current_item: self.queue.current_playlist_item_id(),
                    shuffle_mode: self.queue.shuffle_mode(),
                };
                self.controller.dispatch(request, &mut self.ctx, view);
            }
            SessionCommand::BindPlayer(kind) => self.bind_player(kind).await,
            SessionCommand::FollowGroup => self.follow_group_playback(),
            SessionCommand::HaltGroup => self.halt_group_playback().await,
            SessionCommand::ResumeGroup => self.resume_group_playback().await,
            SessionCommand::Leave => self.disable(true).await,
            SessionCommand::UpdateSettings(settings) => {
                info!("Sync settings updated (profile {})", settings.profile.as_str());
                self.ctx.clock.set_extra_offset(settings.extra_time_offset);
                self.ctx.settings = settings;
            }
            SessionCommand::RefreshClock => {
                if self.state.phase.is_enabled() {
                    self.restart_clock_polling();
                }
            }
            SessionCommand::RefreshJoinedState { allow_enable, respond } => {
                self.start_fetch(FetchReason::Caller { allow_enable, respond });
            }
            SessionCommand::Snapshot(respond) => {
                let _ = respond.send(self.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Probe(result) => self.on_probe(result).await,
            Internal::QueueResolved {
                generation,
                update,
                result,
            } => self.on_queue_resolved(generation, update, result).await,
            Internal::JoinedFetched(result) => self.on_joined_fetched(result).await,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let group = self.state.group.as_ref();
        SessionSnapshot {
            phase: self.state.phase,
            group_id: group.map(|g| g.group_id.clone()),
            group_name: group.map(|g| g.group_name.clone()),
            group_state: group.map(|g| g.state),
            participants: group.map(|g| g.participants.clone()).unwrap_or_default(),
            revision: self.state.latest_revision,
            following: self.state.following,
            player: self.ctx.player.kind(),
            queue_len: self.queue.len(),
            current_item: self.queue.current_playlist_item_id().map(str::to_owned),
            offset_ms: self.ctx.clock.time_offset(),
            ping_ms: self.ctx.clock.estimate_ping(),
            clock_samples: self.ctx.clock.sample_count(),
            playback_diff_ms: self.playback.playback_diff_ms(),
            sync_method: self.playback.sync_method(),
        }
    }

    // Lifecycle

    async fn enable(&mut self, info: GroupInfo, snapshot: Option<GroupSnapshot>) {
        if self.state.phase.is_enabled() {
            if self.state.group_id() == Some(info.group_id.as_str()) {
                debug!("Already in group {}", info.group_id);
                if let Some(snapshot) = snapshot {
                    self.apply_snapshot(snapshot).await;
                }
                return;
            }
            info!("Switching from group {:?} to {}", self.state.group_id(), info.group_id);
            self.disable(false).await;
        }

        info!(
            "Joined group {} ({}), revision {}",
            info.group_name, info.group_id, info.revision
        );

        self.queue.reset();
        self.playback.reset(&mut self.ctx).await;
        self.controller.reset(&mut self.ctx);

        self.state.reset();
        self.state.phase = Phase::Enabling;
        self.state.enabled_at = info.last_updated_at;
        self.state.latest_revision = Some(info.revision);
        self.state.following = true;

        self.ctx.emit(SessionEvent::Enabled {
            group_id: info.group_id.clone(),
            group_name: info.group_name.clone(),
        });
        self.ctx.emit(SessionEvent::Notice(Notice::GroupJoined(info.group_name.clone())));
        self.state.group = Some(info);

        self.restart_clock_polling();
        self.arm_reconcile();

        if let Some(snapshot) = snapshot {
            self.apply_snapshot_contents(snapshot).await;
        }
    }

    async fn disable(&mut self, notify_left: bool) {
        if !self.state.phase.is_enabled() {
            return;
        }
        info!("Leaving group {:?}", self.state.group_id());

        self.poller.stop();
        self.playback.reset(&mut self.ctx).await;
        self.controller.reset(&mut self.ctx);
        self.ctx.timers.cancel_all();
        self.ctx.clock.clear();
        self.queue.reset();
        self.state.reset();

        self.ctx.emit(SessionEvent::Disabled);
        if notify_left {
            self.ctx.emit(SessionEvent::Notice(Notice::GroupLeft));
        }
    }

    fn restart_clock_polling(&mut self) {
        let tx = self.internal_tx.clone();
        self.poller.force_refresh(self.service.clone(), self.ctx.local, move |result| {
            tx.send(Internal::Probe(result)).is_ok()
        });
    }

    fn arm_reconcile(&mut self) {
        let interval = Duration::from_millis(self.ctx.settings.reconcile_interval_ms);
        self.ctx.timers.arm(TimerKey::Reconcile, interval);
    }

    async fn on_probe(&mut self, result: Result<Measurement, ServiceError>) {
        if !self.state.phase.is_enabled() {
            debug!("Dropping clock probe result: not in a group");
            return;
        }

        match result {
            Ok(measurement) => {
                let first = self.ctx.clock.record(measurement);
                let offset_ms = self.ctx.clock.time_offset();
                let ping_ms = self.ctx.clock.estimate_ping();
                self.ctx.emit(SessionEvent::ClockUpdated { offset_ms, ping_ms });
                self.ctx.outbound.send(ServiceRequest::Ping { ping_ms });

                if first && self.state.phase == Phase::Enabling {
                    self.state.phase = Phase::Ready;
                    info!("Clock synchronized (offset {:+.1}ms), session ready", offset_ms);
                    if let Some(command) = self.state.queued_command.take() {
                        self.process_command(command).await;
                    }
                }
            }
            Err(e) => {
                warn!("Clock probe failed: {}", e);
                self.ctx.emit(SessionEvent::Error(format!("Time sync failed: {}", e)));
            }
        }
    }

    // Service input

    async fn on_group_update(&mut self, update: GroupUpdate) {
        match update {
            GroupUpdate::GroupJoined(info) => self.enable(info, None).await,
            GroupUpdate::GroupUpdate(info) => {
                if self.state.group_id() == Some(info.group_id.as_str()) {
                    self.apply_snapshot(GroupSnapshot {
                        group_info: info,
                        play_queue: None,
                        playing_command: None,
                    })
                    .await;
                } else {
                    self.enable(info, None).await;
                }
            }
            GroupUpdate::NotInGroup(_) | GroupUpdate::GroupLeft(_) => {
                if self.state.phase.is_enabled() {
                    info!("Membership signal lost, checking with the service");
                    self.start_fetch(FetchReason::Rehydrate);
                }
            }
            _ if !self.state.phase.is_enabled() => self.on_notice_update(update),
            GroupUpdate::PlayQueue(update) => self.on_queue_update(update),
            GroupUpdate::StateUpdate(update) => {
                if let Some(group) = self.state.group.as_mut() {
                    info!("Group state {} ({})", update.state.as_str(), update.reason);
                    group.state = update.state;
                }
                if update.state == GroupState::Waiting {
                    match update.reason.as_str() {
                        "Pause" => self.ctx.emit(SessionEvent::Osd(OsdCue::WaitPause)),
                        "Unpause" => self.ctx.emit(SessionEvent::Osd(OsdCue::WaitUnpause)),
                        _ => {}
                    }
                }
                self.ctx.emit(SessionEvent::GroupStateChanged {
                    state: update.state,
                    reason: update.reason,
                });
            }
            GroupUpdate::UserJoined(name) => {
                if let Some(group) = self.state.group.as_mut() {
                    if !group.participants.contains(&name) {
                        group.participants.push(name.clone());
                    }
                }
                self.ctx.emit(SessionEvent::Notice(Notice::UserJoined(name)));
            }
            GroupUpdate::UserLeft(name) => {
                if let Some(group) = self.state.group.as_mut() {
                    group.participants.retain(|p| p != &name);
                }
                self.ctx.emit(SessionEvent::Notice(Notice::UserLeft(name)));
            }
            other => self.on_notice_update(other),
        }
    }

    fn on_notice_update(&self, update: GroupUpdate) {
        let notice = match update {
            GroupUpdate::GroupDoesNotExist(_) => Notice::GroupDoesNotExist,
            GroupUpdate::CreateGroupDenied(_) => Notice::CreateGroupDenied,
            GroupUpdate::JoinGroupDenied(_) => Notice::JoinGroupDenied,
            GroupUpdate::LibraryAccessDenied(_) => Notice::LibraryAccessDenied,
            GroupUpdate::SyncPlayIsDisabled(_) => Notice::SyncPlayDisabled,
            other => {
                debug!("Ignoring group update outside a group: {:?}", other);
                return;
            }
        };
        info!("Service notice: {:?}", notice);
        self.ctx.emit(SessionEvent::Notice(notice));
    }

    /// Revision-gated application of an authoritative snapshot
    async fn apply_snapshot(&mut self, snapshot: GroupSnapshot) {
        let revision = snapshot.revision();
        if let Some(latest) = self.state.latest_revision {
            if revision < latest {
                debug!("Discarding stale snapshot revision {} (have {})", revision, latest);
                return;
            }
            if revision == latest {
                if self.ctx.timers.cancel(TimerKey::PendingDisable) {
                    info!("Membership confirmed, staying in group");
                }
                return;
            }
        }

        debug!("Applying snapshot revision {}", revision);
        self.apply_snapshot_contents(snapshot).await;
    }

    async fn apply_snapshot_contents(&mut self, snapshot: GroupSnapshot) {
        if self.ctx.timers.cancel(TimerKey::PendingDisable) {
            info!("Membership confirmed, staying in group");
        }

        let info = snapshot.group_info;
        self.state.latest_revision = Some(info.revision);
        let previous_state = self.state.group_state();
        let state = info.state;
        self.state.group = Some(info);
        if previous_state != Some(state) {
            self.ctx.emit(SessionEvent::GroupStateChanged {
                state,
                reason: "Snapshot".to_string(),
            });
        }

        if let Some(update) = snapshot.play_queue {
            self.on_queue_update(update);
        }

        if state != GroupState::Idle && self.state.following && !self.ctx.player.is_playing() {
            if self.state.queue_resolving.is_some() {
                self.state.pending_resume = true;
            } else {
                self.resume_group_playback().await;
            }
        }

        if let Some(command) = snapshot.playing_command {
            self.process_command(command).await;
        }
    }

    async fn process_command(&mut self, command: PlaybackCommand) {
        if !self.state.phase.is_enabled() {
            debug!("Ignoring {}: not in a group", command.command.as_str());
            return;
        }
        if command.emitted_at < self.state.enabled_at {
            debug!(
                "Ignoring {} emitted before the session started ({} < {})",
                command.command.as_str(),
                command.emitted_at,
                self.state.enabled_at
            );
            return;
        }

        if self.state.phase == Phase::Enabling {
            debug!("Clock not ready, holding {}", command.command.as_str());
            self.state.queued_command = Some(command);
            return;
        }
        if self.state.queue_resolving.is_some() {
            debug!("Queue update in progress, holding {}", command.command.as_str());
            self.state.deferred_command = Some(command);
            return;
        }

        self.state.last_playback_command = Some(command.clone());

        if !self.ctx.player.is_playback_active() {
            debug!("No active player, not applying {}", command.command.as_str());
            return;
        }

        let current_item = self.queue.current_playlist_item_id();
        if command.command != CommandKind::Stop && current_item != Some(command.playlist_item_id.as_str()) {
            warn!(
                "{} targets item {} but {:?} is current, reconciling",
                command.command.as_str(),
                command.playlist_item_id,
                current_item
            );
            self.start_fetch(FetchReason::Reconcile);
            return;
        }

        self.playback.apply_command(command, &mut self.ctx, current_item).await;
    }

    // Queue

    fn on_queue_update(&mut self, update: PlayQueueUpdate) {
        if !self.queue.is_newer(&update) {
            debug!("Discarding stale queue update ({:?})", update.reason);
            return;
        }

        self.state.queue_generation += 1;
        let generation = self.state.queue_generation;
        self.state.queue_resolving = Some(generation);

        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let ids: Vec<String> = update.playlist.iter().map(|item| item.item_id.clone()).collect();
            let result = service.resolve_items(&ids).await;
            let _ = tx.send(Internal::QueueResolved {
                generation,
                update,
                result,
            });
        });
    }

    async fn on_queue_resolved(
        &mut self,
        generation: u64,
        update: PlayQueueUpdate,
        result: Result<Vec<MediaItem>, ServiceError>,
    ) {
        if self.state.queue_resolving != Some(generation) {
            debug!("Dropping superseded queue resolution");
            return;
        }
        self.state.queue_resolving = None;

        match result {
            Ok(items) => match self.queue.apply(update, items) {
                Ok(action) => {
                    self.run_queue_action(action).await;
                    self.ctx.emit(SessionEvent::QueueChanged {
                        entries: self.queue.len(),
                        current: self.queue.current_playlist_item_id().map(str::to_owned),
                    });
                }
                Err(e) => debug!("Queue update not applied: {}", e),
            },
            Err(e) => {
                warn!("Could not resolve queue items: {}", e);
                self.ctx.emit(SessionEvent::Error(format!("Could not load the group queue: {}", e)));
            }
        }

        // A new playlist already started playback
        if std::mem::take(&mut self.state.pending_resume) && !self.state.awaiting_playback_start {
            self.resume_group_playback().await;
        }
        if let Some(command) = self.state.deferred_command.take() {
            self.process_command(command).await;
        }
    }

    async fn run_queue_action(&mut self, action: QueueAction) {
        let result = match action {
            QueueAction::StartPlayback => {
                self.start_playback().await;
                Ok(())
            }
            QueueAction::SwitchItem(playlist_item_id) => {
                if !self.state.following {
                    return;
                }
                match self.ctx.player.local_set_current_playlist_item(&playlist_item_id).await {
                    Ok(()) => {
                        self.await_playback_start();
                        Ok(())
                    }
                    Err(e) => {
                        debug!("Player cannot switch items ({}), restarting playback", e);
                        self.start_playback().await;
                        Ok(())
                    }
                }
            }
            QueueAction::StopPlayback => {
                self.playback.forget_last_command();
                local_op(&self.ctx, LocalOp::Stop).await;
                Ok(())
            }
            QueueAction::RefreshView => self.ctx.player.on_queue_update().await,
            QueueAction::SetRepeatMode(mode) => self.ctx.player.local_set_repeat_mode(mode).await,
            QueueAction::SetShuffleMode(mode) => self.ctx.player.local_set_shuffle_mode(mode).await,
        };

        if let Err(e) = result {
            debug!("Player did not take the queue change: {}", e);
        }
    }

    /// Where the group is, for starting local playback
    fn group_start_position(&self) -> Ticks {
        let now = self.ctx.now_local();
        let queue_update = self.queue.last_update();

        match &self.state.last_playback_command {
            Some(command) if queue_update.map_or(true, |update| command.emitted_at >= update) => {
                let ticks = command.position_ticks.unwrap_or(0);
                if command.command == CommandKind::Unpause {
                    estimate_current_ticks(ticks, command.when, now, &self.ctx.clock)
                } else {
                    ticks
                }
            }
            _ => {
                let ticks = self.queue.start_position_ticks();
                match queue_update {
                    Some(update) if self.queue.is_playing() => {
                        ticks + (self.ctx.now_service() - update).max(0) * TICKS_PER_MS
                    }
                    _ => ticks,
                }
            }
        }
    }

    async fn start_playback(&mut self) {
        if !self.state.following {
            debug!("Not following the group, not starting playback");
            return;
        }
        let Some(start_index) = self.queue.current_index() else {
            debug!("Group queue is empty, nothing to play");
            return;
        };
        if self.ctx.player.kind() == PlayerKind::NoActive {
            debug!("No player bound, not starting playback");
            return;
        }

        let request = PlayRequest {
            entries: self.queue.playlist(),
            start_index,
            start_position_ticks: self.group_start_position(),
        };
        info!(
            "Starting local playback at entry {} from {}",
            start_index, request.start_position_ticks
        );

        self.await_playback_start();
        if let Err(e) = self.ctx.player.local_play(request).await {
            warn!("Local playback failed to start: {}", e);
            self.ctx.emit(SessionEvent::Notice(Notice::PlaybackFailed(e.to_string())));
            self.halt_group_playback().await;
        }
    }

    fn await_playback_start(&mut self) {
        self.state.awaiting_playback_start = true;
        self.ctx.timers.arm(TimerKey::PlaybackStartWait, PLAYBACK_START_TIMEOUT);
    }

    // Following

    fn follow_group_playback(&mut self) {
        if !self.state.phase.is_enabled() {
            return;
        }
        self.state.following = true;
        self.ctx.outbound.send(ServiceRequest::SetIgnoreWait(false));
    }

    async fn halt_group_playback(&mut self) {
        if !self.state.phase.is_enabled() {
            return;
        }
        info!("No longer following group playback");

        self.state.following = false;
        self.state.awaiting_playback_start = false;
        self.ctx.timers.cancel(TimerKey::PlaybackStartWait);
        self.ctx.outbound.send(ServiceRequest::SetIgnoreWait(true));
        self.playback.clear_scheduled_command(&mut self.ctx).await;
        local_op(&self.ctx, LocalOp::Stop).await;
        self.ctx.emit(SessionEvent::Notice(Notice::FollowingHalted));
    }

    async fn resume_group_playback(&mut self) {
        if !self.state.phase.is_enabled() {
            return;
        }
        self.follow_group_playback();
        self.start_playback().await;
    }

    // Joined-state fetches

    fn start_fetch(&mut self, reason: FetchReason) {
        if let Some(waiters) = self.joined_fetch.as_mut() {
            debug!("Joined-state fetch already in flight, sharing it");
            waiters.push(reason);
            return;
        }
        self.joined_fetch = Some(vec![reason]);

        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = service.fetch_joined_state().await;
            let _ = tx.send(Internal::JoinedFetched(result));
        });
    }

    async fn on_joined_fetched(&mut self, result: Result<JoinedState, ServiceError>) {
        let waiters = self.joined_fetch.take().unwrap_or_default();
        let allow_enable = waiters
            .iter()
            .any(|w| matches!(w, FetchReason::Caller { allow_enable: true, .. }));
        let rehydrating = waiters.iter().any(|w| matches!(w, FetchReason::Rehydrate));

        let outcome = match result {
            Ok(JoinedState::Member(snapshot)) => {
                let same_group = self.state.group_id() == Some(snapshot.group_info.group_id.as_str());
                if self.state.phase.is_enabled() && same_group {
                    self.apply_snapshot(snapshot).await;
                } else if allow_enable || self.state.phase.is_enabled() {
                    let info = snapshot.group_info.clone();
                    self.enable(info, Some(snapshot)).await;
                } else {
                    debug!("Member of group {}, not enabling", snapshot.group_info.group_id);
                }
                Ok(true)
            }
            Ok(JoinedState::NotMember) => {
                if self.state.phase.is_enabled() {
                    self.arm_pending_disable();
                }
                Ok(false)
            }
            Err(e) => {
                warn!("Joined-state fetch failed: {}", e);
                if self.state.phase.is_enabled() && rehydrating {
                    self.arm_pending_disable();
                }
                Err(e.to_string())
            }
        };

        for waiter in waiters {
            if let FetchReason::Caller { respond, .. } = waiter {
                let _ = respond.send(outcome.clone().map_err(SessionError::Service));
            }
        }
    }

    fn arm_pending_disable(&mut self) {
        if self.ctx.timers.is_armed(TimerKey::PendingDisable) {
            return;
        }
        let grace = self.ctx.settings.disable_grace_millis;
        info!("Membership not confirmed, leaving in {}ms unless it is", grace);
        self.ctx.timers.arm(TimerKey::PendingDisable, Duration::from_millis(grace));
    }

    // Timers and player

    async fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::ScheduledCommand | TimerKey::SyncTimeout | TimerKey::PlayerWait | TimerKey::BufferingNotice => {
                let current_item = self.queue.current_playlist_item_id();
                self.playback.on_timer(key, &mut self.ctx, current_item).await;
            }
            TimerKey::SeekFlush => self.controller.on_seek_flush(&mut self.ctx),
            TimerKey::TransportFlush => self.controller.on_transport_flush(&mut self.ctx),
            TimerKey::PlaybackStartWait => {
                if std::mem::take(&mut self.state.awaiting_playback_start) {
                    warn!("Player did not start within {:?}", PLAYBACK_START_TIMEOUT);
                    self.ctx.emit(SessionEvent::Notice(Notice::PlaybackFailed(
                        "Playback did not start".to_string(),
                    )));
                    self.halt_group_playback().await;
                }
            }
            TimerKey::Reconcile => {
                if self.state.phase.is_enabled() {
                    self.start_fetch(FetchReason::Reconcile);
                    self.arm_reconcile();
                }
            }
            TimerKey::PendingDisable => {
                if self.state.phase.is_enabled() {
                    info!("Membership not confirmed within grace window");
                    self.disable(true).await;
                }
            }
        }
    }

    async fn bind_player(&mut self, kind: Option<PlayerKind>) {
        let player = self.registry.read().resolve(kind);
        if Arc::ptr_eq(&player, &self.ctx.player) {
            return;
        }

        self.playback.clear_scheduled_command(&mut self.ctx).await;
        self.ctx.player = player;
        let kind = self.ctx.player.kind();
        info!("Player bound: {}", kind.as_str());
        self.ctx.emit(SessionEvent::PlayerChanged(kind));
    }

    async fn on_player_event(&mut self, event: PlayerEvent) {
        if !self.state.phase.is_enabled() {
            return;
        }

        match &event {
            PlayerEvent::PlaybackStart => {
                self.state.playback_errors = 0;
                if std::mem::take(&mut self.state.awaiting_playback_start) {
                    self.ctx.timers.cancel(TimerKey::PlaybackStartWait);
                    debug!("Playback started, waiting for the group");
                    local_op(&self.ctx, LocalOp::Pause).await;
                    let current_item = self.queue.current_playlist_item_id();
                    self.playback.send_buffering_request(false, &self.ctx, current_item).await;
                }
            }
            PlayerEvent::PlaybackError(message) => {
                self.state.playback_errors += 1;
                warn!("Playback error {}: {}", self.state.playback_errors, message);
                self.ctx.emit(SessionEvent::Notice(Notice::PlaybackFailed(message.clone())));
                if self.state.playback_errors >= MAX_PLAYBACK_ERRORS {
                    self.state.playback_errors = 0;
                    self.halt_group_playback().await;
                }
                return;
            }
            PlayerEvent::PlaybackStop => debug!("Local playback stopped"),
            _ => {}
        }

        let current_item = self.queue.current_playlist_item_id();
        self.playback.on_player_event(&event, &mut self.ctx, current_item).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::new_shared_registry;
    use crate::service::{GroupStateUpdate, QueueItem, QueueUpdateReason, RepeatMode, ShuffleMode};
    use crate::session::{Session, SessionHandle};
    use crate::test_support::{MockPlayer, MockService, PlayerCall};
    use crate::time::Millis;
    use tokio::sync::broadcast;

    const T0: Millis = 1_700_000_000_000;

    fn group_info(revision: u64, state: GroupState) -> GroupInfo {
        GroupInfo {
            group_id: "g1".to_string(),
            group_name: "Movie night".to_string(),
            state,
            participants: vec!["alice".to_string()],
            last_updated_at: T0 - 10_000,
            revision,
        }
    }

    fn new_playlist(last_update: Millis) -> PlayQueueUpdate {
        PlayQueueUpdate {
            reason: QueueUpdateReason::NewPlaylist,
            last_update,
            playlist: vec![
                QueueItem {
                    item_id: "item-a".to_string(),
                    playlist_item_id: "pl-1".to_string(),
                },
                QueueItem {
                    item_id: "item-b".to_string(),
                    playlist_item_id: "pl-2".to_string(),
                },
            ],
            playing_item_index: 0,
            start_position_ticks: 0,
            is_playing: false,
            shuffle_mode: ShuffleMode::Sorted,
            repeat_mode: RepeatMode::RepeatNone,
        }
    }

    fn snapshot(revision: u64, state: GroupState, with_queue: bool) -> GroupSnapshot {
        GroupSnapshot {
            group_info: group_info(revision, state),
            play_queue: with_queue.then(|| new_playlist(T0 - 5_000)),
            playing_command: None,
        }
    }

    fn command(kind: CommandKind, when: Millis, position_ticks: Ticks, item: &str) -> PlaybackCommand {
        PlaybackCommand {
            command: kind,
            when,
            emitted_at: when,
            position_ticks: Some(position_ticks),
            playlist_item_id: item.to_string(),
        }
    }

    struct Fixture {
        handle: SessionHandle,
        events: broadcast::Receiver<SessionEvent>,
        player: Arc<MockPlayer>,
        service: Arc<MockService>,
        clock: LocalClock,
    }

    impl Fixture {
        async fn new() -> Self {
            let clock = LocalClock::anchored_at(T0);
            let service = Arc::new(MockService::new(clock, 0));
            let (handle, events) = Session::new(SyncSettings::default(), service.clone(), new_shared_registry())
                .with_clock(clock)
                .start();

            let player = MockPlayer::new(PlayerKind::Video);
            handle.register_player(player.clone());
            handle.bind_player(PlayerKind::Video).unwrap();

            Self {
                handle,
                events,
                player,
                service,
                clock,
            }
        }

        /// Let spawned work run, then wait for the session to drain its inbox
        async fn settle(&self) -> SessionSnapshot {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.handle.snapshot().await.unwrap()
        }

        /// Service time; the mock service runs on the local clock
        fn now(&self) -> Millis {
            self.clock.now_ms()
        }

        async fn join(&self, snapshot: GroupSnapshot) {
            self.service.set_joined_state(Some(JoinedState::Member(snapshot)));
            assert!(self.handle.refresh_joined_state(true).await.unwrap());
            assert_eq!(self.settle().await.phase, Phase::Ready);
        }

        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_revision_after_higher_is_ignored() {
        let f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;

        f.handle
            .group_update(GroupUpdate::GroupUpdate(group_info(3, GroupState::Playing)))
            .unwrap();
        let snap = f.settle().await;
        assert_eq!(snap.revision, Some(5));
        assert_eq!(snap.group_state, Some(GroupState::Paused));

        f.handle
            .group_update(GroupUpdate::GroupUpdate(group_info(7, GroupState::Playing)))
            .unwrap();
        // Same revision again is a no-op
        f.handle
            .group_update(GroupUpdate::GroupUpdate(group_info(7, GroupState::Waiting)))
            .unwrap();
        let snap = f.settle().await;
        assert_eq!(snap.revision, Some(7));
        assert_eq!(snap.group_state, Some(GroupState::Playing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_revision_cancels_pending_disable() {
        let mut f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        f.drain_events();

        f.service.set_joined_state(Some(JoinedState::NotMember));
        f.handle.group_update(GroupUpdate::NotInGroup("g1".to_string())).unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(f.handle.snapshot().await.unwrap().phase, Phase::Ready);

        // Nothing new in it, but it proves we are still in the group
        f.handle
            .group_update(GroupUpdate::GroupUpdate(group_info(5, GroupState::Paused)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3_000)).await;

        let snap = f.handle.snapshot().await.unwrap();
        assert_eq!(snap.phase, Phase::Ready);
        assert_eq!(snap.revision, Some(5));
        assert!(!f.drain_events().contains(&SessionEvent::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_applies_missed_revision() {
        let mut f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        f.drain_events();
        let fetches = f.service.fetch_count();

        // The push for revision 6 never arrives
        f.service
            .set_joined_state(Some(JoinedState::Member(snapshot(6, GroupState::Playing, false))));
        tokio::time::sleep(Duration::from_millis(SyncSettings::default().reconcile_interval_ms)).await;
        let snap = f.settle().await;

        assert_eq!(f.service.fetch_count(), fetches + 1);
        assert_eq!(snap.phase, Phase::Ready);
        assert_eq!(snap.revision, Some(6));
        assert_eq!(snap.group_state, Some(GroupState::Playing));
        assert!(f.drain_events().contains(&SessionEvent::GroupStateChanged {
            state: GroupState::Playing,
            reason: "Snapshot".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_state_emits_wait_cues() {
        let mut f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Playing, false)).await;
        f.drain_events();

        for reason in ["Pause", "Unpause", "Buffer"] {
            f.handle
                .group_update(GroupUpdate::StateUpdate(GroupStateUpdate {
                    state: GroupState::Waiting,
                    reason: reason.to_string(),
                }))
                .unwrap();
        }
        let snap = f.settle().await;
        assert_eq!(snap.group_state, Some(GroupState::Waiting));

        let cues: Vec<SessionEvent> = f
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Osd(_)))
            .collect();
        assert_eq!(
            cues,
            vec![
                SessionEvent::Osd(OsdCue::WaitPause),
                SessionEvent::Osd(OsdCue::WaitUnpause)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_starts_queue_and_reports_ready() {
        let f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, true)).await;

        let snap = f.handle.snapshot().await.unwrap();
        assert_eq!(snap.queue_len, 2);
        assert_eq!(snap.current_item.as_deref(), Some("pl-1"));
        assert_eq!(
            f.player.take_calls(),
            vec![PlayerCall::Play {
                start_index: 0,
                start_position_ticks: 0
            }]
        );

        f.handle.player_events().emit(PlayerEvent::PlaybackStart);
        f.settle().await;
        assert_eq!(f.player.take_calls(), vec![PlayerCall::Pause]);
        assert!(f.service.request_names().contains(&"Ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_unpause_seeks_to_group_position() {
        let f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, true)).await;
        f.handle.player_events().emit(PlayerEvent::PlaybackStart);
        f.settle().await;
        f.player.take_calls();

        let when = f.now() - 2_000;
        f.handle
            .playback_command(command(CommandKind::Unpause, when, 100_000, "pl-1"))
            .unwrap();
        f.settle().await;

        assert_eq!(
            f.player.take_calls(),
            vec![
                PlayerCall::Seek(100_000 + 2_000 * TICKS_PER_MS),
                PlayerCall::Unpause
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_in_group_with_confirmed_membership_stays_enabled() {
        let mut f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        f.drain_events();

        f.handle.group_update(GroupUpdate::NotInGroup("g1".to_string())).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snap = f.handle.snapshot().await.unwrap();
        assert_eq!(snap.phase, Phase::Ready);
        assert!(!f.drain_events().contains(&SessionEvent::Disabled));
        assert_eq!(f.service.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_membership_disables_after_grace() {
        let mut f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        f.drain_events();

        f.service.set_joined_state(Some(JoinedState::NotMember));
        f.handle.group_update(GroupUpdate::GroupLeft("g1".to_string())).unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(f.handle.snapshot().await.unwrap().phase, Phase::Ready);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(f.handle.snapshot().await.unwrap().phase, Phase::Disabled);
        let events = f.drain_events();
        assert!(events.contains(&SessionEvent::Disabled));
        assert!(events.contains(&SessionEvent::Notice(Notice::GroupLeft)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rehydrates_share_one_fetch() {
        let f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        assert_eq!(f.service.fetch_count(), 1);

        f.service.set_fetch_delay(Duration::from_millis(200));
        f.handle.group_update(GroupUpdate::NotInGroup("g1".to_string())).unwrap();
        f.handle.group_update(GroupUpdate::NotInGroup("g1".to_string())).unwrap();
        assert!(f.handle.refresh_joined_state(false).await.unwrap());

        assert_eq!(f.service.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_seeks_send_latest_once() {
        let f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;

        f.handle.seek(10_000).unwrap();
        f.handle.seek(20_000).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        f.settle().await;

        let seeks: Vec<ServiceRequest> = f
            .service
            .requests()
            .into_iter()
            .filter(|r| matches!(r, ServiceRequest::Seek { .. }))
            .collect();
        assert_eq!(seeks, vec![ServiceRequest::Seek { position_ticks: 20_000 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_from_before_join_are_rejected() {
        let f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        f.player.take_calls();

        let mut stale = command(CommandKind::Stop, f.now(), 0, "pl-1");
        stale.emitted_at = T0 - 20_000;
        f.handle.playback_command(stale).unwrap();
        f.settle().await;
        assert!(f.player.take_calls().is_empty());

        f.handle.playback_command(command(CommandKind::Stop, f.now(), 0, "pl-1")).unwrap();
        f.settle().await;
        assert_eq!(f.player.take_calls(), vec![PlayerCall::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_wait_for_clock() {
        let f = Fixture::new().await;
        f.service.fail_probes(1);
        f.handle
            .group_update(GroupUpdate::GroupJoined(group_info(1, GroupState::Idle)))
            .unwrap();
        f.handle.playback_command(command(CommandKind::Stop, f.now(), 0, "")).unwrap();

        let snap = f.settle().await;
        assert_eq!(snap.phase, Phase::Enabling);
        assert!(f.player.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snap = f.settle().await;
        assert_eq!(snap.phase, Phase::Ready);
        assert_eq!(f.player.calls(), vec![PlayerCall::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_for_other_item_triggers_reconcile() {
        let f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, true)).await;
        f.player.take_calls();
        let fetches = f.service.fetch_count();

        f.handle
            .playback_command(command(CommandKind::Unpause, f.now(), 0, "pl-9"))
            .unwrap();
        f.settle().await;

        assert!(f.player.take_calls().is_empty());
        assert_eq!(f.service.fetch_count(), fetches + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_playback_errors_halt_following() {
        let mut f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        f.drain_events();

        let sink = f.handle.player_events();
        for _ in 0..MAX_PLAYBACK_ERRORS {
            sink.emit(PlayerEvent::PlaybackError("decoder crashed".to_string()));
        }
        let snap = f.settle().await;

        assert!(!snap.following);
        assert!(f.service.requests().contains(&ServiceRequest::SetIgnoreWait(true)));
        assert!(f
            .drain_events()
            .contains(&SessionEvent::Notice(Notice::FollowingHalted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_disables() {
        let mut f = Fixture::new().await;
        f.join(snapshot(5, GroupState::Paused, false)).await;
        f.drain_events();

        f.handle.leave().unwrap();
        let snap = f.settle().await;

        assert_eq!(snap.phase, Phase::Disabled);
        assert_eq!(snap.revision, None);
        assert_eq!(snap.clock_samples, 0);
        let events = f.drain_events();
        assert!(events.contains(&SessionEvent::Disabled));
        assert!(events.contains(&SessionEvent::Notice(Notice::GroupLeft)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_only_enables_when_allowed() {
        let f = Fixture::new().await;
        f.service
            .set_joined_state(Some(JoinedState::Member(snapshot(2, GroupState::Idle, false))));

        assert!(f.handle.refresh_joined_state(false).await.unwrap());
        assert_eq!(f.settle().await.phase, Phase::Disabled);

        assert!(f.handle.refresh_joined_state(true).await.unwrap());
        let snap = f.settle().await;
        assert_eq!(snap.phase, Phase::Ready);
        assert_eq!(snap.group_id.as_deref(), Some("g1"));
        assert_eq!(snap.player, PlayerKind::Video);
    }
}
