//! Outbound request dispatch
//!
//! User requests go through here on their way to the service. Transport
//! toggles are rate-limited to the latest intent, seeks are debounced to the
//! latest position, and everything else passes straight through.

use tracing::{debug, info};

use crate::service::{GroupState, QueueMode, RepeatMode, ServiceRequest, ShuffleMode};
use crate::session::{Notice, SessionContext, SessionEvent, TimerKey};
use crate::time::{Millis, Ticks};

/// A request from the local user to the group
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Unpause,
    Pause,
    Seek(Ticks),
    Stop,
    SetNewQueue {
        item_ids: Vec<String>,
        start_index: usize,
        start_position_ticks: Ticks,
    },
    Queue {
        item_ids: Vec<String>,
        mode: QueueMode,
    },
    RemoveFromPlaylist(Vec<String>),
    MovePlaylistItem {
        playlist_item_id: String,
        new_index: usize,
    },
    SetCurrentItem(String),
    NextItem,
    PreviousItem,
    SetRepeatMode(RepeatMode),
    SetShuffleMode(ShuffleMode),
    ToggleShuffle,
}

/// Group state the dispatcher needs to decide on a request
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DispatchView<'a> {
    pub group_state: Option<GroupState>,
    pub current_item: Option<&'a str>,
    pub shuffle_mode: ShuffleMode,
}

#[derive(Debug, Default)]
pub(crate) struct Controller {
    /// Local time of the last unpause/pause sent
    last_transport: Option<Millis>,
    /// The last unpause/pause sent
    last_toggle: Option<ServiceRequest>,
    /// Toggle waiting for the cooldown to expire
    pending_toggle: Option<ServiceRequest>,
    /// Seek waiting for the cooldown to expire
    pending_seek: Option<Ticks>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn pending_seek(&self) -> Option<Ticks> {
        self.pending_seek
    }

    pub fn dispatch(&mut self, request: ControlRequest, ctx: &mut SessionContext, view: DispatchView<'_>) {
        match request {
            ControlRequest::Unpause => self.unpause(ctx, view.group_state),
            ControlRequest::Pause => self.transport(ServiceRequest::Pause, ctx),
            ControlRequest::Seek(position_ticks) => self.seek(position_ticks, ctx),
            ControlRequest::Stop => ctx.outbound.send(ServiceRequest::Stop),
            ControlRequest::SetNewQueue {
                item_ids,
                start_index,
                start_position_ticks,
            } => ctx.outbound.send(ServiceRequest::SetNewQueue {
                item_ids,
                start_index,
                start_position_ticks,
            }),
            ControlRequest::Queue { item_ids, mode } => ctx.outbound.send(ServiceRequest::Queue { item_ids, mode }),
            ControlRequest::RemoveFromPlaylist(playlist_item_ids) => {
                ctx.outbound.send(ServiceRequest::RemoveFromPlaylist { playlist_item_ids })
            }
            ControlRequest::MovePlaylistItem {
                playlist_item_id,
                new_index,
            } => ctx.outbound.send(ServiceRequest::MovePlaylistItem {
                playlist_item_id,
                new_index,
            }),
            ControlRequest::SetCurrentItem(playlist_item_id) => {
                ctx.outbound.send(ServiceRequest::SetCurrentItem { playlist_item_id })
            }
            ControlRequest::NextItem => match view.current_item {
                Some(id) => ctx.outbound.send(ServiceRequest::NextItem {
                    playlist_item_id: id.to_string(),
                }),
                None => debug!("Next item ignored: nothing playing"),
            },
            ControlRequest::PreviousItem => match view.current_item {
                Some(id) => ctx.outbound.send(ServiceRequest::PreviousItem {
                    playlist_item_id: id.to_string(),
                }),
                None => debug!("Previous item ignored: nothing playing"),
            },
            ControlRequest::SetRepeatMode(mode) => ctx.outbound.send(ServiceRequest::SetRepeatMode(mode)),
            ControlRequest::SetShuffleMode(mode) => ctx.outbound.send(ServiceRequest::SetShuffleMode(mode)),
            ControlRequest::ToggleShuffle => {
                let mode = match view.shuffle_mode {
                    ShuffleMode::Sorted => ShuffleMode::Shuffle,
                    ShuffleMode::Shuffle => ShuffleMode::Sorted,
                };
                ctx.outbound.send(ServiceRequest::SetShuffleMode(mode));
            }
        }
    }

    fn unpause(&mut self, ctx: &mut SessionContext, group_state: Option<GroupState>) {
        if ctx.settings.enforce_ready_before_unpause && group_state == Some(GroupState::Waiting) {
            info!("Unpause suppressed: group is waiting for members to be ready");
            ctx.emit(SessionEvent::Notice(Notice::WaitingForGroup));
            return;
        }
        self.transport(ServiceRequest::Unpause, ctx);
    }

    fn transport(&mut self, request: ServiceRequest, ctx: &mut SessionContext) {
        let now = ctx.now_local();
        let cooldown = ctx.settings.command_cooldown_ms as Millis;
        if let Some(last) = self.last_transport {
            if now - last < cooldown {
                debug!("{} held ({}ms since last transport request)", request.name(), now - last);
                self.pending_toggle = Some(request);
                if !ctx.timers.is_armed(TimerKey::TransportFlush) {
                    ctx.timers.arm_ms(TimerKey::TransportFlush, cooldown - (now - last));
                }
                return;
            }
        }

        self.pending_toggle = None;
        ctx.timers.cancel(TimerKey::TransportFlush);
        self.send_toggle(request, ctx);
    }

    fn send_toggle(&mut self, request: ServiceRequest, ctx: &mut SessionContext) {
        self.last_transport = Some(ctx.now_local());
        self.last_toggle = Some(request.clone());
        ctx.outbound.send(request);
    }

    /// Cooldown expired: send the latest toggle unless it undoes nothing
    pub fn on_transport_flush(&mut self, ctx: &mut SessionContext) {
        let Some(request) = self.pending_toggle.take() else {
            return;
        };
        if self.last_toggle.as_ref() == Some(&request) {
            debug!("{} already sent, dropping held toggle", request.name());
            return;
        }
        self.send_toggle(request, ctx);
    }

    fn seek(&mut self, position_ticks: Ticks, ctx: &mut SessionContext) {
        if self.pending_seek.replace(position_ticks).is_some() {
            debug!("Pending seek replaced by {}", position_ticks);
        }
        if !ctx.timers.is_armed(TimerKey::SeekFlush) {
            ctx.timers.arm_ms(TimerKey::SeekFlush, ctx.settings.command_cooldown_ms as i64);
        }
    }

    /// Cooldown expired: send the latest seek
    pub fn on_seek_flush(&mut self, ctx: &mut SessionContext) {
        if let Some(position_ticks) = self.pending_seek.take() {
            ctx.outbound.send(ServiceRequest::Seek { position_ticks });
        }
    }

    pub fn reset(&mut self, ctx: &mut SessionContext) {
        ctx.timers.cancel(TimerKey::SeekFlush);
        ctx.timers.cancel(TimerKey::TransportFlush);
        *self = Self::default();
    }
}
