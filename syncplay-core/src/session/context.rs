//! State shared by the components of one session

use std::sync::Arc;

use super::events::{EventBus, SessionEvent};
use super::outbound::Outbound;
use super::timers::Timers;
use crate::clock::ClockSync;
use crate::config::SyncSettings;
use crate::player::LocalPlayer;
use crate::time::{LocalClock, Millis};

/// Everything the scheduler, dispatcher and queue handling reach into.
/// Owned by the session task; never shared across tasks.
pub(crate) struct SessionContext {
    pub player: Arc<dyn LocalPlayer>,
    pub clock: ClockSync,
    pub local: LocalClock,
    pub settings: SyncSettings,
    pub timers: Timers,
    pub events: EventBus,
    pub outbound: Outbound,
}

impl SessionContext {
    pub fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    /// Local now
    pub fn now_local(&self) -> Millis {
        self.local.now_ms()
    }

    /// Service now, per the current clock estimate
    pub fn now_service(&self) -> Millis {
        self.clock.local_to_service(self.local.now_ms())
    }
}
