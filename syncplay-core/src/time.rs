//! Time units shared by every component
//!
//! Positions inside media are expressed in ticks (100ns units, as the
//! coordination service reports them). Instants are milliseconds since the
//! Unix epoch, either on the local clock or on the service clock.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Milliseconds since the Unix epoch (local or service clock, depending on context)
pub type Millis = i64;

/// Media position in ticks
pub type Ticks = i64;

/// Number of ticks in one millisecond
pub const TICKS_PER_MS: i64 = 10_000;

/// Convert a tick position to milliseconds
pub fn ticks_to_ms(ticks: Ticks) -> f64 {
    ticks as f64 / TICKS_PER_MS as f64
}

/// Convert milliseconds to ticks (rounded to the nearest tick)
pub fn ms_to_ticks(ms: f64) -> Ticks {
    (ms * TICKS_PER_MS as f64).round() as Ticks
}

/// Local wall clock backed by the monotonic tokio clock.
///
/// The wall time is sampled once and then advanced with `tokio::time::Instant`,
/// so the clock never jumps backwards and follows a paused runtime in tests.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    anchor: Instant,
    anchor_ms: Millis,
}

impl LocalClock {
    /// Anchor to the current system time
    pub fn new() -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Millis;
        Self::anchored_at(anchor_ms)
    }

    /// Anchor to an explicit wall time (used by simulations and tests)
    pub fn anchored_at(anchor_ms: Millis) -> Self {
        Self {
            anchor: Instant::now(),
            anchor_ms,
        }
    }

    /// Current local time in milliseconds
    pub fn now_ms(&self) -> Millis {
        self.anchor_ms + self.anchor.elapsed().as_millis() as Millis
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde adapter: service timestamps travel as ISO-8601 strings and are held
/// as epoch milliseconds.
pub mod iso8601 {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Millis;

    pub fn serialize<S: Serializer>(ms: &Millis, serializer: S) -> Result<S::Ok, S::Error> {
        match Utc.timestamp_millis_opt(*ms).single() {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            None => Err(serde::ser::Error::custom(format!("timestamp out of range: {}", ms))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Millis, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.timestamp_millis())
            .map_err(serde::de::Error::custom)
    }
}
