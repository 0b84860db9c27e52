//! Command scheduling and drift correction
//!
//! Turns service commands into local player actions at the right local
//! instant, keeps the local position aligned with the group while playing,
//! and answers the service's ready/buffering handshake.

mod drift;

pub use drift::{plan_correction, Correction, MAX_SPEED_ATTEMPTS, MAX_SYNC_ATTEMPTS, MIN_SPEED};

use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::ClockSync;
use crate::player::PlayerEvent;
use crate::service::{BufferingReport, CommandKind, PlaybackCommand, ServiceRequest};
use crate::session::{OsdCue, SessionContext, SessionEvent, SyncMethod, TimerKey};
use crate::time::{ms_to_ticks, Millis, Ticks, TICKS_PER_MS};

/// How long to wait for the player to confirm a pause
pub const WAIT_FOR_PLAYER_EVENT: Duration = Duration::from_millis(500);

/// Width of the random offset added when re-applying a duplicate seek
const DUPLICATE_SEEK_JITTER_MS: i64 = 50;

/// Group position now, extrapolated from a position held at service time `when`
pub fn estimate_current_ticks(ticks: Ticks, when: Millis, now_local: Millis, clock: &ClockSync) -> Ticks {
    let now_service = clock.local_to_service(now_local);
    ticks + (now_service - when) * TICKS_PER_MS
}

/// Player operations the scheduler issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalOp {
    Unpause,
    Pause,
    Seek(Ticks),
    Stop,
}

/// Run a player operation if a player is active. Failures are reported, not returned.
pub(crate) async fn local_op(ctx: &SessionContext, op: LocalOp) {
    if !ctx.player.is_playback_active() {
        debug!("Local {:?} ignored: no active player", op);
        return;
    }

    let result = match op {
        LocalOp::Unpause => ctx.player.local_unpause().await,
        LocalOp::Pause => ctx.player.local_pause().await,
        LocalOp::Seek(ticks) => ctx.player.local_seek(ticks).await,
        LocalOp::Stop => ctx.player.local_stop().await,
    };

    if let Err(e) = result {
        warn!("Local {:?} failed: {}", op, e);
        ctx.emit(SessionEvent::Error(format!("Player could not {:?}: {}", op, e)));
    }
}

/// Action armed on the scheduled-command timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduledAction {
    Unpause,
    Pause(Ticks),
    Seek(Ticks),
    Stop,
}

/// Action armed on the sync timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncTimeoutAction {
    /// Grace delay after a transport change, or cooldown after a seek correction
    EnableCorrections,
    /// End of a rate correction
    RestoreRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AwaitedEvent {
    Pause,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitAction {
    Seek(Ticks),
    PauseAndReportReady,
    ForceSeek(Ticks),
}

/// A player event the scheduler is waiting for, with what to do either way
#[derive(Debug, Clone, Copy)]
struct PendingWait {
    event: AwaitedEvent,
    on_event: WaitAction,
    on_timeout: WaitAction,
}

/// Scheduler state ("playback core")
#[derive(Debug)]
pub struct PlaybackCore {
    last_command: Option<PlaybackCommand>,
    scheduled: Option<ScheduledAction>,
    sync_timeout: Option<SyncTimeoutAction>,
    wait: Option<PendingWait>,
    /// Corrections armed
    sync_enabled: bool,
    /// Corrections suspended until the next transport change
    sync_suspended: bool,
    sync_attempts: u32,
    /// Local time of the last drift evaluation
    last_sync_time: Millis,
    playback_diff_ms: f64,
    sync_method: SyncMethod,
    /// Local time the current stall began
    buffering_since: Option<Millis>,
}

impl Default for PlaybackCore {
    fn default() -> Self {
        Self {
            last_command: None,
            scheduled: None,
            sync_timeout: None,
            wait: None,
            sync_enabled: false,
            sync_suspended: false,
            sync_attempts: 0,
            last_sync_time: Millis::MIN / 2,
            playback_diff_ms: 0.0,
            sync_method: SyncMethod::None,
            buffering_since: None,
        }
    }
}

impl PlaybackCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_command(&self) -> Option<&PlaybackCommand> {
        self.last_command.as_ref()
    }

    /// Forget the last command (playback stopped, queue changed)
    pub fn forget_last_command(&mut self) {
        self.last_command = None;
    }

    pub fn playback_diff_ms(&self) -> f64 {
        self.playback_diff_ms
    }

    pub fn sync_method(&self) -> SyncMethod {
        self.sync_method
    }

    pub fn corrections_armed(&self) -> bool {
        self.sync_enabled
    }

    /// Stalled for longer than `buffering_threshold_millis`
    fn is_buffering(&self, ctx: &SessionContext) -> bool {
        self.buffering_since
            .map_or(false, |since| ctx.now_local() - since > ctx.settings.buffering_threshold_millis as Millis)
    }

    /// Apply a command from the service.
    ///
    /// A command identical to the last one is not re-executed; the player
    /// state is checked against it and corrected only if it drifted.
    pub(crate) async fn apply_command(
        &mut self,
        command: PlaybackCommand,
        ctx: &mut SessionContext,
        current_item: Option<&str>,
    ) {
        if self.last_command.as_ref() == Some(&command) {
            self.reverify(command, ctx, current_item).await;
            return;
        }

        self.last_command = Some(command.clone());

        if ctx.player.is_remote() {
            debug!("Remote player follows the group on its own, not scheduling {}", command.command.as_str());
            return;
        }

        let position = command.position_ticks.unwrap_or(0);
        match command.command {
            CommandKind::Unpause => self.schedule_unpause(command.when, position, ctx).await,
            CommandKind::Pause => self.schedule_pause(command.when, position, ctx).await,
            CommandKind::Stop => self.schedule_stop(command.when, ctx).await,
            CommandKind::Seek => self.schedule_seek(command.when, position, ctx).await,
        }
    }

    /// Duplicate command: correct only what no longer matches
    async fn reverify(&mut self, command: PlaybackCommand, ctx: &mut SessionContext, current_item: Option<&str>) {
        let when_local = ctx.clock.service_to_local(command.when);
        if when_local > ctx.now_local() {
            debug!("Duplicate {} already scheduled", command.command.as_str());
            return;
        }

        let position_ticks = match ctx.player.current_time().await {
            Ok(ms) => ms * TICKS_PER_MS,
            Err(e) => {
                debug!("Cannot verify duplicate {}: {}", command.command.as_str(), e);
                return;
            }
        };
        let is_playing = ctx.player.is_playing();
        let target = command.position_ticks.unwrap_or(0);
        let off_target = (position_ticks - target).abs() > ms_to_ticks(ctx.settings.min_delay_skip_to_sync);

        debug!(
            "Duplicate {}: playing={} position={} target={}",
            command.command.as_str(),
            is_playing,
            position_ticks,
            target
        );

        match command.command {
            // Position is left to drift correction
            CommandKind::Unpause if !is_playing => self.schedule_unpause(command.when, target, ctx).await,
            CommandKind::Pause if is_playing || off_target => {
                self.schedule_pause(command.when, target, ctx).await
            }
            CommandKind::Stop if is_playing => self.schedule_stop(command.when, ctx).await,
            CommandKind::Seek if is_playing || off_target => {
                // The player may treat a seek to where it already is as a no-op
                let jitter_ms = rand::thread_rng().gen_range(-DUPLICATE_SEEK_JITTER_MS..=DUPLICATE_SEEK_JITTER_MS);
                debug!("Re-applying seek with {:+}ms offset", jitter_ms);
                self.schedule_seek(command.when, target + jitter_ms * TICKS_PER_MS, ctx).await
            }
            CommandKind::Seek => self.send_buffering_request(false, ctx, current_item).await,
            _ => {}
        }
    }

    async fn current_ticks(ctx: &SessionContext) -> Option<Ticks> {
        ctx.player.current_time().await.ok().map(|ms| ms * TICKS_PER_MS)
    }

    async fn schedule_unpause(&mut self, when: Millis, position_ticks: Ticks, ctx: &mut SessionContext) {
        self.clear_scheduled_command(ctx).await;

        let now = ctx.now_local();
        let when_local = ctx.clock.service_to_local(when);
        let current = Self::current_ticks(ctx).await;
        let tolerance = ms_to_ticks(ctx.settings.min_delay_skip_to_sync);

        if when_local > now {
            if current.map_or(false, |c| (c - position_ticks).abs() > tolerance) {
                local_op(ctx, LocalOp::Seek(position_ticks)).await;
            }

            self.scheduled = Some(ScheduledAction::Unpause);
            ctx.timers.arm_ms(TimerKey::ScheduledCommand, when_local - now);
            debug!("Scheduled unpause in {:.3}s", (when_local - now) as f64 / 1000.0);
        } else {
            // Group already playing: join at the extrapolated position
            let server_ticks = estimate_current_ticks(position_ticks, when, now, &ctx.clock);
            let late_ms = now - when_local;
            let needs_seek = late_ms as f64 > ctx.settings.max_late_command_millis
                || current.map_or(true, |c| (c - server_ticks).abs() > tolerance);

            if needs_seek {
                local_op(ctx, LocalOp::Seek(server_ticks)).await;
            }
            local_op(ctx, LocalOp::Unpause).await;
            ctx.emit(SessionEvent::Osd(OsdCue::Unpause));
            self.arm_sync_timeout(SyncTimeoutAction::EnableCorrections, ctx.settings.sync_grace_ms(), ctx);

            info!(
                "Unpause {}ms late, from {} (was at {:?})",
                late_ms, server_ticks, current
            );
        }
    }

    async fn schedule_pause(&mut self, when: Millis, position_ticks: Ticks, ctx: &mut SessionContext) {
        self.clear_scheduled_command(ctx).await;

        let now = ctx.now_local();
        let when_local = ctx.clock.service_to_local(when);

        if when_local > now {
            self.scheduled = Some(ScheduledAction::Pause(position_ticks));
            ctx.timers.arm_ms(TimerKey::ScheduledCommand, when_local - now);
            debug!("Scheduled pause in {:.3}s", (when_local - now) as f64 / 1000.0);
        } else {
            self.pause_now(position_ticks, ctx).await;
        }
    }

    async fn pause_now(&mut self, position_ticks: Ticks, ctx: &mut SessionContext) {
        // Pausing lands a little late; the exact position is restored once paused
        self.wait_for(
            PendingWait {
                event: AwaitedEvent::Pause,
                on_event: WaitAction::Seek(position_ticks),
                on_timeout: WaitAction::Seek(position_ticks),
            },
            WAIT_FOR_PLAYER_EVENT,
            ctx,
        );
        local_op(ctx, LocalOp::Pause).await;
        ctx.emit(SessionEvent::Osd(OsdCue::Pause));
        debug!("Paused, will settle at {}", position_ticks);
    }

    async fn schedule_stop(&mut self, when: Millis, ctx: &mut SessionContext) {
        self.clear_scheduled_command(ctx).await;

        let now = ctx.now_local();
        let when_local = ctx.clock.service_to_local(when);

        if when_local > now {
            self.scheduled = Some(ScheduledAction::Stop);
            ctx.timers.arm_ms(TimerKey::ScheduledCommand, when_local - now);
            debug!("Scheduled stop in {:.3}s", (when_local - now) as f64 / 1000.0);
        } else {
            local_op(ctx, LocalOp::Stop).await;
            debug!("Stopped");
        }
    }

    async fn schedule_seek(&mut self, when: Millis, position_ticks: Ticks, ctx: &mut SessionContext) {
        self.clear_scheduled_command(ctx).await;

        let now = ctx.now_local();
        let when_local = ctx.clock.service_to_local(when);

        if when_local > now {
            self.scheduled = Some(ScheduledAction::Seek(position_ticks));
            ctx.timers.arm_ms(TimerKey::ScheduledCommand, when_local - now);
            debug!("Scheduled seek in {:.3}s", (when_local - now) as f64 / 1000.0);
        } else {
            self.seek_now(position_ticks, ctx).await;
        }
    }

    async fn seek_now(&mut self, position_ticks: Ticks, ctx: &mut SessionContext) {
        // Some players only seek while playing; re-pause on the exact frame once ready
        local_op(ctx, LocalOp::Unpause).await;
        local_op(ctx, LocalOp::Seek(position_ticks)).await;
        ctx.emit(SessionEvent::Osd(OsdCue::Seek));

        let timeout = Duration::from_millis(ctx.settings.seek_ready_event_timeout_ms);
        self.wait_for(
            PendingWait {
                event: AwaitedEvent::Ready,
                on_event: WaitAction::PauseAndReportReady,
                on_timeout: WaitAction::ForceSeek(position_ticks),
            },
            timeout,
            ctx,
        );
        debug!("Seeking to {}, waiting for ready", position_ticks);
    }

    fn wait_for(&mut self, wait: PendingWait, timeout: Duration, ctx: &mut SessionContext) {
        self.wait = Some(wait);
        ctx.timers.arm(TimerKey::PlayerWait, timeout);
    }

    fn arm_sync_timeout(&mut self, action: SyncTimeoutAction, delay_ms: u64, ctx: &mut SessionContext) {
        self.sync_timeout = Some(action);
        ctx.timers.arm(TimerKey::SyncTimeout, Duration::from_millis(delay_ms));
    }

    async fn run_wait_action(&mut self, action: WaitAction, ctx: &mut SessionContext, current_item: Option<&str>) {
        match action {
            WaitAction::Seek(ticks) => local_op(ctx, LocalOp::Seek(ticks)).await,
            WaitAction::PauseAndReportReady => {
                local_op(ctx, LocalOp::Pause).await;
                self.send_buffering_request(false, ctx, current_item).await;
            }
            WaitAction::ForceSeek(ticks) => {
                warn!("Timed out waiting for ready, forcing seek to {}", ticks);
                ctx.emit(SessionEvent::Error("Player did not become ready after seeking".to_string()));
                local_op(ctx, LocalOp::Seek(ticks)).await;
            }
        }
    }

    /// Cancel everything pending: scheduled command, sync timer, event waits.
    /// Also disarms corrections and puts the rate back to 1.0.
    pub(crate) async fn clear_scheduled_command(&mut self, ctx: &mut SessionContext) {
        ctx.timers.cancel(TimerKey::ScheduledCommand);
        ctx.timers.cancel(TimerKey::SyncTimeout);
        ctx.timers.cancel(TimerKey::PlayerWait);
        self.scheduled = None;
        self.sync_timeout = None;
        self.wait = None;

        self.sync_enabled = false;
        self.sync_suspended = false;
        if ctx.player.has_playback_rate() {
            if let Err(e) = ctx.player.set_playback_rate(1.0).await {
                debug!("Could not reset playback rate: {}", e);
            }
        }

        self.set_sync_method(SyncMethod::None, ctx);
    }

    /// Session teardown
    pub(crate) async fn reset(&mut self, ctx: &mut SessionContext) {
        self.clear_scheduled_command(ctx).await;
        ctx.timers.cancel(TimerKey::BufferingNotice);
        *self = Self::default();
    }

    fn set_sync_method(&mut self, method: SyncMethod, ctx: &SessionContext) {
        if self.sync_method != method {
            self.sync_method = method;
            ctx.emit(SessionEvent::SyncMethod(method));
        }
    }

    /// Timer owned by the scheduler fired
    pub(crate) async fn on_timer(&mut self, key: TimerKey, ctx: &mut SessionContext, current_item: Option<&str>) {
        match key {
            TimerKey::ScheduledCommand => match self.scheduled.take() {
                Some(ScheduledAction::Unpause) => {
                    local_op(ctx, LocalOp::Unpause).await;
                    ctx.emit(SessionEvent::Osd(OsdCue::Unpause));
                    self.arm_sync_timeout(SyncTimeoutAction::EnableCorrections, ctx.settings.sync_grace_ms(), ctx);
                    debug!("Unpaused on schedule");
                }
                Some(ScheduledAction::Pause(ticks)) => self.pause_now(ticks, ctx).await,
                Some(ScheduledAction::Seek(ticks)) => self.seek_now(ticks, ctx).await,
                Some(ScheduledAction::Stop) => {
                    local_op(ctx, LocalOp::Stop).await;
                    debug!("Stopped on schedule");
                }
                None => {}
            },
            TimerKey::SyncTimeout => match self.sync_timeout.take() {
                Some(SyncTimeoutAction::EnableCorrections) => {
                    self.sync_enabled = true;
                    self.set_sync_method(SyncMethod::None, ctx);
                    debug!("Drift corrections armed");
                }
                Some(SyncTimeoutAction::RestoreRate) => {
                    if let Err(e) = ctx.player.set_playback_rate(1.0).await {
                        debug!("Could not restore playback rate: {}", e);
                    }
                    self.sync_enabled = true;
                    self.set_sync_method(SyncMethod::None, ctx);
                }
                None => {}
            },
            TimerKey::PlayerWait => {
                if let Some(wait) = self.wait.take() {
                    debug!("Gave up waiting for {:?}", wait.event);
                    self.run_wait_action(wait.on_timeout, ctx, current_item).await;
                }
            }
            TimerKey::BufferingNotice => {
                if self.buffering_since.is_some() {
                    info!("Player buffering for over {}ms", ctx.settings.buffering_threshold_millis);
                    ctx.emit(SessionEvent::Osd(OsdCue::Buffering));
                }
            }
            _ => {}
        }
    }

    /// Player notification
    pub(crate) async fn on_player_event(&mut self, event: &PlayerEvent, ctx: &mut SessionContext, current_item: Option<&str>) {
        match event {
            PlayerEvent::Ready => {
                self.buffering_since = None;
                ctx.timers.cancel(TimerKey::BufferingNotice);
                self.send_buffering_request(false, ctx, current_item).await;
                self.resolve_wait(AwaitedEvent::Ready, ctx, current_item).await;
            }
            PlayerEvent::Buffering => {
                if self.buffering_since.is_none() {
                    self.buffering_since = Some(ctx.now_local());
                    ctx.timers.arm_ms(TimerKey::BufferingNotice, ctx.settings.buffering_threshold_millis as Millis);
                }
                self.send_buffering_request(true, ctx, current_item).await;
            }
            PlayerEvent::Pause => self.resolve_wait(AwaitedEvent::Pause, ctx, current_item).await,
            PlayerEvent::TimeUpdate { position_ms } => {
                self.sync_playback_time(*position_ms, ctx, current_item).await;
            }
            _ => {}
        }
    }

    async fn resolve_wait(&mut self, event: AwaitedEvent, ctx: &mut SessionContext, current_item: Option<&str>) {
        match self.wait {
            Some(wait) if wait.event == event => {
                self.wait = None;
                ctx.timers.cancel(TimerKey::PlayerWait);
                self.run_wait_action(wait.on_event, ctx, current_item).await;
            }
            _ => {}
        }
    }

    /// Report buffering state and position to the service
    pub(crate) async fn send_buffering_request(&self, is_buffering: bool, ctx: &SessionContext, current_item: Option<&str>) {
        let position_ms = match ctx.player.current_time().await {
            Ok(ms) => ms,
            Err(e) => {
                debug!("No position for buffering report: {}", e);
                0
            }
        };

        let report = BufferingReport {
            when: ctx.now_service(),
            position_ticks: position_ms * TICKS_PER_MS,
            is_playing: ctx.player.is_playing(),
            playlist_item_id: current_item.unwrap_or_default().to_string(),
            is_buffering,
        };
        ctx.outbound.send(ServiceRequest::Buffering(report));
    }

    /// Measure drift against the group and correct it if needed
    async fn sync_playback_time(&mut self, position_ms: f64, ctx: &mut SessionContext, current_item: Option<&str>) {
        if !ctx.player.is_playback_active() {
            return;
        }

        let Some(command) = self.last_command.as_ref() else {
            return;
        };
        if command.command != CommandKind::Unpause || self.is_buffering(ctx) {
            return;
        }
        // Item switch in progress: the position belongs to another item
        if current_item != Some(command.playlist_item_id.as_str()) {
            return;
        }

        let now = ctx.now_local();
        let server_ticks = estimate_current_ticks(command.position_ticks.unwrap_or(0), command.when, now, &ctx.clock);
        let diff_ms = (server_ticks - ms_to_ticks(position_ms)) as f64 / TICKS_PER_MS as f64;

        self.playback_diff_ms = diff_ms;
        ctx.emit(SessionEvent::PlaybackDiff(diff_ms));

        // Throttle evaluations
        if now - self.last_sync_time < ctx.settings.sync_grace_ms() as Millis {
            return;
        }
        self.last_sync_time = now;

        if !self.sync_enabled || self.sync_suspended || !ctx.settings.enable_sync_correction {
            return;
        }

        let correction = plan_correction(diff_ms, &ctx.settings, ctx.player.has_playback_rate(), self.sync_attempts);

        // The cap only applies when another correction would be needed
        if correction != Correction::InSync && self.sync_attempts >= MAX_SYNC_ATTEMPTS {
            warn!("Still {:+.0}ms off after {} corrections, suspending sync", diff_ms, self.sync_attempts);
            self.sync_enabled = false;
            self.sync_suspended = true;
            self.set_sync_method(SyncMethod::Disabled, ctx);
            return;
        }

        match correction {
            Correction::SpeedToSync { rate, duration_ms } => {
                if let Err(e) = ctx.player.set_playback_rate(rate).await {
                    warn!("SpeedToSync failed: {}", e);
                    return;
                }
                self.sync_enabled = false;
                self.sync_attempts += 1;
                self.set_sync_method(SyncMethod::SpeedToSync { rate }, ctx);
                self.arm_sync_timeout(SyncTimeoutAction::RestoreRate, duration_ms.round() as u64, ctx);
                info!("SpeedToSync: drift={:+.0}ms rate={:.2} for {:.0}ms", diff_ms, rate, duration_ms);
            }
            Correction::SkipToSync => {
                local_op(ctx, LocalOp::Seek(server_ticks)).await;
                self.sync_enabled = false;
                self.sync_attempts += 1;
                self.set_sync_method(SyncMethod::SkipToSync { attempt: self.sync_attempts }, ctx);
                self.arm_sync_timeout(SyncTimeoutAction::EnableCorrections, ctx.settings.sync_grace_ms(), ctx);
                info!("SkipToSync: drift={:+.0}ms, seeking to {}", diff_ms, server_ticks);
            }
            Correction::InSync => {
                if self.sync_attempts > 0 {
                    debug!("Playback synced after {} attempts", self.sync_attempts);
                }
                self.sync_attempts = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Measurement;
    use crate::player::PlayerKind;
    use crate::session::testing::ContextHarness;
    use crate::test_support::PlayerCall;

    const T0: Millis = 1_700_000_000_000;

    fn command(kind: CommandKind, when: Millis, position_ticks: Ticks) -> PlaybackCommand {
        PlaybackCommand {
            command: kind,
            when,
            emitted_at: when - 500,
            position_ticks: Some(position_ticks),
            playlist_item_id: "pl-1".to_string(),
        }
    }

    /// Harness whose service clock runs `offset` ms ahead of the local one
    fn harness(offset: Millis) -> ContextHarness {
        let mut h = ContextHarness::new(PlayerKind::Video, T0);
        let now = h.ctx.now_local();
        h.ctx.clock.record(Measurement::new(now, now + offset, now + offset, now));
        h
    }

    #[test]
    fn test_estimate_current_ticks() {
        let mut clock = ClockSync::new();
        clock.record(Measurement::new(0, 500, 500, 0));
        // local 10_000 is service 10_500, 2s after the reference
        assert_eq!(estimate_current_ticks(100_000, 8_500, 10_000, &clock), 100_000 + 2_000 * TICKS_PER_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_unpause_seeks_to_extrapolated_position() {
        let mut h = harness(0);
        h.player.set_position_ms(0);
        let mut core = PlaybackCore::new();

        let now_service = h.ctx.now_service();
        core.apply_command(command(CommandKind::Unpause, now_service - 2_000, 100_000), &mut h.ctx, Some("pl-1"))
            .await;

        let calls = h.player.calls();
        assert_eq!(
            &calls[..],
            &[PlayerCall::Seek(100_000 + 2_000 * TICKS_PER_MS), PlayerCall::Unpause]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_unpause_waits_for_timer() {
        let mut h = harness(250);
        let mut core = PlaybackCore::new();

        let when = h.ctx.now_service() + 1_000;
        core.apply_command(command(CommandKind::Unpause, when, 0), &mut h.ctx, Some("pl-1")).await;
        assert!(!h.player.calls().contains(&PlayerCall::Unpause));

        let key = h.next_timer().await;
        assert_eq!(key, TimerKey::ScheduledCommand);
        assert_eq!(h.ctx.now_service(), when);
        core.on_timer(key, &mut h.ctx, Some("pl-1")).await;
        assert!(h.player.calls().contains(&PlayerCall::Unpause));

        // Corrections arm after the grace delay
        assert!(!core.corrections_armed());
        let key = h.next_timer().await;
        assert_eq!(key, TimerKey::SyncTimeout);
        core.on_timer(key, &mut h.ctx, Some("pl-1")).await;
        assert!(core.corrections_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_command_is_not_reexecuted() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();
        let cmd = command(CommandKind::Unpause, h.ctx.now_service() - 100, 0);

        core.apply_command(cmd.clone(), &mut h.ctx, Some("pl-1")).await;
        let first = h.player.take_calls();
        assert!(first.contains(&PlayerCall::Unpause));

        // Player is playing as commanded: nothing to correct
        core.apply_command(cmd, &mut h.ctx, Some("pl-1")).await;
        assert!(h.player.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_future_command_is_ignored() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();
        let cmd = command(CommandKind::Pause, h.ctx.now_service() + 5_000, 0);

        core.apply_command(cmd.clone(), &mut h.ctx, Some("pl-1")).await;
        h.player.take_calls();
        core.apply_command(cmd, &mut h.ctx, Some("pl-1")).await;
        assert!(h.player.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_settles_position_after_pause_event() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();
        h.player.set_playing(true);

        core.apply_command(command(CommandKind::Pause, h.ctx.now_service(), 42_000_000), &mut h.ctx, Some("pl-1"))
            .await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::Pause]);

        core.on_player_event(&PlayerEvent::Pause, &mut h.ctx, Some("pl-1")).await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::Seek(42_000_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_waits_for_ready_then_reports() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();

        core.apply_command(command(CommandKind::Seek, h.ctx.now_service(), 90_000_000), &mut h.ctx, Some("pl-1"))
            .await;
        assert_eq!(
            h.player.take_calls(),
            vec![PlayerCall::Unpause, PlayerCall::Seek(90_000_000)]
        );

        core.on_player_event(&PlayerEvent::Ready, &mut h.ctx, Some("pl-1")).await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::Pause]);

        h.settle().await;
        let names: Vec<&str> = h.service.requests().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["Ready", "Ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_ready_timeout_forces_seek() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();
        let mut events = h.ctx.events.subscribe();

        core.apply_command(command(CommandKind::Seek, h.ctx.now_service(), 5_000_000), &mut h.ctx, Some("pl-1"))
            .await;
        h.player.take_calls();

        let key = h.next_timer().await;
        assert_eq!(key, TimerKey::PlayerWait);
        core.on_timer(key, &mut h.ctx, Some("pl-1")).await;

        assert_eq!(h.player.take_calls(), vec![PlayerCall::Seek(5_000_000)]);
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, SessionEvent::Error(_));
        }
        assert!(saw_error);
    }

    /// Start playing at position 0 with corrections armed
    async fn playing_core(h: &mut ContextHarness) -> PlaybackCore {
        let mut core = PlaybackCore::new();
        let when = h.ctx.now_service();
        core.apply_command(command(CommandKind::Unpause, when, 0), &mut h.ctx, Some("pl-1")).await;
        let key = h.next_timer().await;
        core.on_timer(key, &mut h.ctx, Some("pl-1")).await;
        assert!(core.corrections_armed());
        h.player.take_calls();
        core
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_drift_is_left_alone() {
        let mut h = harness(0);
        h.player.set_has_rate(true);
        let mut core = playing_core(&mut h).await;

        let group_ms = core_group_position_ms(&h, &core);
        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 30.0 }, &mut h.ctx, Some("pl-1"))
            .await;

        assert!(h.player.take_calls().is_empty());
        assert!((core.playback_diff_ms() - 30.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moderate_drift_changes_rate_then_restores() {
        let mut h = harness(0);
        h.player.set_has_rate(true);
        let mut core = playing_core(&mut h).await;

        let group_ms = core_group_position_ms(&h, &core);
        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 500.0 }, &mut h.ctx, Some("pl-1"))
            .await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::SetRate(1.5)]);
        assert_eq!(core.sync_method(), SyncMethod::SpeedToSync { rate: 1.5 });

        let key = h.next_timer().await;
        assert_eq!(key, TimerKey::SyncTimeout);
        core.on_timer(key, &mut h.ctx, Some("pl-1")).await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::SetRate(1.0)]);
        assert_eq!(core.sync_method(), SyncMethod::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_drift_seeks() {
        let mut h = harness(0);
        h.player.set_has_rate(true);
        let mut core = playing_core(&mut h).await;

        let group_ms = core_group_position_ms(&h, &core);
        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 4_000.0 }, &mut h.ctx, Some("pl-1"))
            .await;

        let calls = h.player.take_calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], PlayerCall::Seek(_)));
        assert_eq!(core.sync_method(), SyncMethod::SkipToSync { attempt: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_correction_for_other_item_or_buffering() {
        let mut h = harness(0);
        h.player.set_has_rate(true);
        let mut core = playing_core(&mut h).await;
        let group_ms = core_group_position_ms(&h, &core);

        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 4_000.0 }, &mut h.ctx, Some("pl-2"))
            .await;
        assert!(h.player.take_calls().is_empty());

        core.on_player_event(&PlayerEvent::Buffering, &mut h.ctx, Some("pl-1")).await;
        tokio::time::sleep(Duration::from_millis(h.ctx.settings.buffering_threshold_millis + 1)).await;
        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 4_000.0 }, &mut h.ctx, Some("pl-1"))
            .await;
        assert!(h.player.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffering_cue_only_after_threshold() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();
        let mut events = h.ctx.events.subscribe();

        // Short stall: the service hears about it, the user does not
        core.on_player_event(&PlayerEvent::Buffering, &mut h.ctx, Some("pl-1")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        core.on_player_event(&PlayerEvent::Ready, &mut h.ctx, Some("pl-1")).await;
        h.settle().await;
        assert_eq!(h.service.request_names(), vec!["Buffering", "Ready"]);

        let start = h.ctx.now_local();
        core.on_player_event(&PlayerEvent::Buffering, &mut h.ctx, Some("pl-1")).await;
        let key = h.next_timer().await;
        assert_eq!(key, TimerKey::BufferingNotice);
        assert_eq!(h.ctx.now_local() - start, h.ctx.settings.buffering_threshold_millis as Millis);
        core.on_timer(key, &mut h.ctx, Some("pl-1")).await;

        let mut cues = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Osd(cue) = event {
                cues.push(cue);
            }
        }
        assert_eq!(cues, vec![OsdCue::Buffering]);
    }

    /// Drive `MAX_SYNC_ATTEMPTS` seek corrections, each re-armed after its cooldown
    async fn exhaust_attempts(h: &mut ContextHarness, core: &mut PlaybackCore) {
        for attempt in 1..=MAX_SYNC_ATTEMPTS {
            let group_ms = core_group_position_ms(h, core);
            core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 4_000.0 }, &mut h.ctx, Some("pl-1"))
                .await;
            assert_eq!(core.sync_method(), SyncMethod::SkipToSync { attempt });

            let key = h.next_timer().await;
            assert_eq!(key, TimerKey::SyncTimeout);
            core.on_timer(key, &mut h.ctx, Some("pl-1")).await;
            assert!(core.corrections_armed());
        }
        h.player.take_calls();
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_sync_after_last_attempt_resets_counter() {
        let mut h = harness(0);
        let mut core = playing_core(&mut h).await;
        exhaust_attempts(&mut h, &mut core).await;

        // The fifth seek worked
        let group_ms = core_group_position_ms(&h, &core);
        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 5.0 }, &mut h.ctx, Some("pl-1"))
            .await;
        assert_eq!(core.sync_method(), SyncMethod::None);
        assert!(core.corrections_armed());
        assert!(h.player.take_calls().is_empty());

        // A later drift starts a fresh series
        tokio::time::sleep(Duration::from_millis(h.ctx.settings.sync_grace_ms())).await;
        let group_ms = core_group_position_ms(&h, &core);
        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 4_000.0 }, &mut h.ctx, Some("pl-1"))
            .await;
        assert_eq!(core.sync_method(), SyncMethod::SkipToSync { attempt: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrections_suspend_when_attempts_keep_missing() {
        let mut h = harness(0);
        let mut core = playing_core(&mut h).await;
        exhaust_attempts(&mut h, &mut core).await;

        let group_ms = core_group_position_ms(&h, &core);
        core.on_player_event(&PlayerEvent::TimeUpdate { position_ms: group_ms - 4_000.0 }, &mut h.ctx, Some("pl-1"))
            .await;
        assert_eq!(core.sync_method(), SyncMethod::Disabled);
        assert!(!core.corrections_armed());
        assert!(h.player.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_pause_while_playing_pauses_again() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();
        h.player.set_playing(true);
        let cmd = command(CommandKind::Pause, h.ctx.now_service(), 42_000_000);

        core.apply_command(cmd.clone(), &mut h.ctx, Some("pl-1")).await;
        core.on_player_event(&PlayerEvent::Pause, &mut h.ctx, Some("pl-1")).await;
        h.player.take_calls();

        // Someone resumed the player behind our back
        h.player.set_playing(true);
        core.apply_command(cmd, &mut h.ctx, Some("pl-1")).await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::Pause]);

        core.on_player_event(&PlayerEvent::Pause, &mut h.ctx, Some("pl-1")).await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::Seek(42_000_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_stop_while_playing_stops_again() {
        let mut h = harness(0);
        let mut core = PlaybackCore::new();
        let cmd = command(CommandKind::Stop, h.ctx.now_service(), 0);

        core.apply_command(cmd.clone(), &mut h.ctx, Some("pl-1")).await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::Stop]);

        core.apply_command(cmd.clone(), &mut h.ctx, Some("pl-1")).await;
        assert!(h.player.take_calls().is_empty());

        h.player.set_playing(true);
        core.apply_command(cmd, &mut h.ctx, Some("pl-1")).await;
        assert_eq!(h.player.take_calls(), vec![PlayerCall::Stop]);
    }

    /// Seek to `target` and complete the ready handshake
    async fn seeked_core(h: &mut ContextHarness, target: Ticks) -> (PlaybackCore, PlaybackCommand) {
        let mut core = PlaybackCore::new();
        let cmd = command(CommandKind::Seek, h.ctx.now_service(), target);
        core.apply_command(cmd.clone(), &mut h.ctx, Some("pl-1")).await;
        core.on_player_event(&PlayerEvent::Ready, &mut h.ctx, Some("pl-1")).await;
        h.settle().await;
        h.player.take_calls();
        h.service.take_requests();
        (core, cmd)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_seek_off_target_reseeks_with_jitter() {
        let mut h = harness(0);
        let target = 90_000_000;
        let (mut core, cmd) = seeked_core(&mut h, target).await;

        h.player.set_position_ms(0);
        core.apply_command(cmd, &mut h.ctx, Some("pl-1")).await;

        let calls = h.player.take_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], PlayerCall::Unpause);
        match calls[1] {
            PlayerCall::Seek(ticks) => {
                assert!((ticks - target).abs() <= DUPLICATE_SEEK_JITTER_MS * TICKS_PER_MS);
            }
            ref other => panic!("expected a seek, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_seek_on_target_only_reports_ready() {
        let mut h = harness(0);
        let (mut core, cmd) = seeked_core(&mut h, 90_000_000).await;

        core.apply_command(cmd, &mut h.ctx, Some("pl-1")).await;
        h.settle().await;

        assert!(h.player.take_calls().is_empty());
        assert_eq!(h.service.request_names(), vec!["Ready"]);
    }

    /// Where the group is right now for the last Unpause, in ms
    fn core_group_position_ms(h: &ContextHarness, core: &PlaybackCore) -> f64 {
        let cmd = core.last_command().unwrap();
        let ticks = estimate_current_ticks(cmd.position_ticks.unwrap_or(0), cmd.when, h.ctx.now_local(), &h.ctx.clock);
        ticks as f64 / TICKS_PER_MS as f64
    }
}
