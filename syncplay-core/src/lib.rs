//! SyncPlay Core Library
//!
//! Client-side engine that keeps one local media player in lock-step with a
//! group directed by a coordination service: clock offset estimation,
//! scheduled transport commands, drift correction, queue tracking and
//! revision-gated reconciliation with the group's authoritative state.

pub mod clock;
pub mod config;
pub mod controller;
pub mod logging;
pub mod playback;
pub mod player;
pub mod queue;
pub mod service;
pub mod session;
pub mod time;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use config::{SyncProfile, SyncSettings};
pub use player::{LocalPlayer, PlayRequest, PlayerError, PlayerEvent, PlayerEventSink, PlayerKind};
pub use service::{GroupService, HttpGroupService, ServiceError};
pub use session::{Phase, Session, SessionError, SessionEvent, SessionHandle, SessionSnapshot};
