//! Context harness for component tests

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::context::SessionContext;
use super::events::EventBus;
use super::outbound::{Outbound, RequestFailure};
use super::timers::{TimerFired, TimerKey, Timers};
use crate::clock::ClockSync;
use crate::config::SyncSettings;
use crate::player::PlayerKind;
use crate::test_support::{MockPlayer, MockService};
use crate::time::{LocalClock, Millis};

/// A session context wired to a mock player and a mock service, with the
/// timer channel exposed so tests can step through fires.
pub(crate) struct ContextHarness {
    pub ctx: SessionContext,
    pub player: Arc<MockPlayer>,
    pub service: Arc<MockService>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    _failure_rx: mpsc::UnboundedReceiver<RequestFailure>,
}

impl ContextHarness {
    pub fn new(kind: PlayerKind, anchor_ms: Millis) -> Self {
        let local = LocalClock::anchored_at(anchor_ms);
        let service = Arc::new(MockService::new(local, 0));
        let player = MockPlayer::new(kind);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let ctx = SessionContext {
            player: player.clone(),
            clock: ClockSync::new(),
            local,
            settings: SyncSettings::default(),
            timers: Timers::new(timer_tx),
            events: EventBus::new(),
            outbound: Outbound::start(service.clone(), failure_tx),
        };

        Self {
            ctx,
            player,
            service,
            timer_rx,
            _failure_rx: failure_rx,
        }
    }

    /// Wait for the next live timer fire
    pub async fn next_timer(&mut self) -> TimerKey {
        loop {
            let fired = self.timer_rx.recv().await.expect("timer channel closed");
            if self.ctx.timers.take(fired) {
                return fired.key;
            }
        }
    }

    /// Let spawned work (outbound sends) run
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
