//! One round-trip clock probe

use crate::time::Millis;

/// Four timestamps of a single time probe.
///
/// `request_sent` and `response_received` are local times,
/// `request_received` and `response_sent` are service times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub request_sent: Millis,
    pub request_received: Millis,
    pub response_sent: Millis,
    pub response_received: Millis,
}

impl Measurement {
    pub fn new(
        request_sent: Millis,
        request_received: Millis,
        response_sent: Millis,
        response_received: Millis,
    ) -> Self {
        Self {
            request_sent,
            request_received,
            response_sent,
            response_received,
        }
    }

    /// Service clock minus local clock, in milliseconds
    pub fn offset(&self) -> f64 {
        ((self.request_received - self.request_sent) + (self.response_sent - self.response_received))
            as f64
            / 2.0
    }

    /// Round-trip network delay, excluding service processing time
    pub fn delay(&self) -> Millis {
        (self.response_received - self.request_sent) - (self.response_sent - self.request_received)
    }

    /// Estimated one-way latency
    pub fn ping(&self) -> f64 {
        self.delay() as f64 / 2.0
    }
}
