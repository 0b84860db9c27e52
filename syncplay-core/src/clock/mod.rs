//! Clock synchronization with the coordination service
//!
//! Keeps a bounded window of round-trip measurements and uses the one with
//! the lowest delay as the active estimate. Under variable latency the most
//! recent probe is often the noisiest one, so recency is never the criterion.

mod measurement;
mod poller;

pub use measurement::Measurement;
pub use poller::ClockPoller;

use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::time::Millis;

/// Number of measurements kept in the window
pub const MEASUREMENT_WINDOW: usize = 8;

/// Probes sent at the short interval after enabling or a forced refresh
pub const GREEDY_PROBE_COUNT: u32 = 3;

/// Interval between probes while converging
pub const GREEDY_INTERVAL: Duration = Duration::from_millis(1_000);

/// Interval between probes once an estimate exists
pub const LOW_PROFILE_INTERVAL: Duration = Duration::from_millis(60_000);

/// Offset and ping estimate between the local clock and the service clock
#[derive(Debug, Default)]
pub struct ClockSync {
    /// Most recent measurements, oldest first
    window: VecDeque<Measurement>,
    /// Lowest-delay measurement in the window
    active: Option<Measurement>,
    /// Manual offset added on top of the measured one
    extra_offset_ms: f64,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a measurement. Returns true if this was the first estimate.
    pub fn record(&mut self, measurement: Measurement) -> bool {
        let first = self.active.is_none();

        if self.window.len() >= MEASUREMENT_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(measurement);

        self.active = self.window.iter().copied().min_by_key(|m| m.delay());

        debug!(
            "Clock probe: offset={:+.1}ms delay={}ms, active offset={:+.1}ms ping={:.1}ms ({} samples)",
            measurement.offset(),
            measurement.delay(),
            self.estimate_offset(),
            self.estimate_ping(),
            self.window.len()
        );

        first
    }

    /// Whether at least one measurement has been taken
    pub fn is_ready(&self) -> bool {
        self.active.is_some()
    }

    /// Measured service-minus-local offset in milliseconds, without the manual offset
    pub fn estimate_offset(&self) -> f64 {
        self.active.map(|m| m.offset()).unwrap_or(0.0)
    }

    /// Estimated one-way latency in milliseconds
    pub fn estimate_ping(&self) -> f64 {
        self.active.map(|m| m.ping()).unwrap_or(0.0)
    }

    /// Offset applied when converting between clocks
    pub fn time_offset(&self) -> f64 {
        self.estimate_offset() + self.extra_offset_ms
    }

    pub fn set_extra_offset(&mut self, extra_offset_ms: f64) {
        self.extra_offset_ms = extra_offset_ms;
    }

    pub fn extra_offset(&self) -> f64 {
        self.extra_offset_ms
    }

    /// Convert a local instant to service time
    pub fn local_to_service(&self, local: Millis) -> Millis {
        local + self.time_offset().round() as Millis
    }

    /// Convert a service instant to local time
    pub fn service_to_local(&self, service: Millis) -> Millis {
        service - self.time_offset().round() as Millis
    }

    /// Number of measurements in the window
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Drop all measurements (session teardown)
    pub fn clear(&mut self) {
        self.window.clear();
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(sent: Millis, offset: Millis, one_way: Millis) -> Measurement {
        Measurement::new(sent, sent + offset + one_way, sent + offset + one_way, sent + 2 * one_way)
    }

    #[test]
    fn test_first_measurement_reports_ready() {
        let mut clock = ClockSync::new();
        assert!(!clock.is_ready());
        assert!(clock.record(probe(0, 100, 10)));
        assert!(!clock.record(probe(1_000, 100, 10)));
        assert!(clock.is_ready());
    }

    #[test]
    fn test_min_delay_wins_over_latest() {
        let mut clock = ClockSync::new();
        clock.record(probe(0, 200, 50));
        clock.record(probe(1_000, 120, 5));
        clock.record(probe(2_000, 400, 80));

        assert_eq!(clock.estimate_offset(), 120.0);
        assert_eq!(clock.estimate_ping(), 5.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut clock = ClockSync::new();
        // The best probe ages out once the window is full
        clock.record(probe(0, 999, 1));
        for i in 1..=MEASUREMENT_WINDOW as i64 {
            clock.record(probe(i * 1_000, 50, 10 + i));
        }

        assert_eq!(clock.sample_count(), MEASUREMENT_WINDOW);
        assert_eq!(clock.estimate_offset(), 50.0);
        assert_eq!(clock.estimate_ping(), 11.0);
    }

    #[test]
    fn test_conversion_includes_extra_offset() {
        let mut clock = ClockSync::new();
        clock.record(probe(0, 2_000, 10));
        clock.set_extra_offset(50.0);

        assert_eq!(clock.local_to_service(10_000), 12_050);
        assert_eq!(clock.service_to_local(12_050), 10_000);
    }
}
