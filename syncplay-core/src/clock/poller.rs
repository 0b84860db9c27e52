//! Background probe loop feeding the clock estimate

use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use super::{Measurement, GREEDY_INTERVAL, GREEDY_PROBE_COUNT, LOW_PROFILE_INTERVAL};
use crate::service::{GroupService, ServiceError};
use crate::time::LocalClock;

/// Run one time probe against the service
pub async fn probe(service: &dyn GroupService, clock: &LocalClock) -> Result<Measurement, ServiceError> {
    let request_sent = clock.now_ms();
    let reply = service.probe_time().await?;
    let response_received = clock.now_ms();

    Ok(Measurement::new(
        request_sent,
        reply.request_received,
        reply.response_sent,
        response_received,
    ))
}

/// Cancellable polling loop.
///
/// The loop does not own the measurement window; it only hands each probe
/// result to a sink. Restarting the loop restarts the greedy phase.
#[derive(Default)]
pub struct ClockPoller {
    cancel: Option<oneshot::Sender<()>>,
}

impl ClockPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Start (or restart) polling. `sink` returns false once nobody listens,
    /// which ends the loop.
    pub fn start<F>(&mut self, service: Arc<dyn GroupService>, clock: LocalClock, sink: F)
    where
        F: Fn(Result<Measurement, ServiceError>) -> bool + Send + 'static,
    {
        self.stop();

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.cancel = Some(cancel_tx);

        tokio::spawn(async move {
            debug!("Clock poll loop started");
            let mut probes_sent: u32 = 0;

            loop {
                let result = tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    result = probe(service.as_ref(), &clock) => result,
                };

                if !sink(result) {
                    break;
                }
                probes_sent = probes_sent.saturating_add(1);

                let interval = if probes_sent < GREEDY_PROBE_COUNT {
                    GREEDY_INTERVAL
                } else {
                    LOW_PROFILE_INTERVAL
                };

                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            debug!("Clock poll loop stopped");
        });
    }

    /// Back to the greedy phase
    pub fn force_refresh<F>(&mut self, service: Arc<dyn GroupService>, clock: LocalClock, sink: F)
    where
        F: Fn(Result<Measurement, ServiceError>) -> bool + Send + 'static,
    {
        debug!("Clock estimate refresh forced");
        self.start(service, clock, sink);
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for ClockPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
