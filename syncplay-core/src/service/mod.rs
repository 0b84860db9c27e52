//! Group-coordination service surface

mod client;
mod request;
mod types;

pub use client::HttpGroupService;
pub use request::{QueueMode, ServiceRequest};
pub use types::*;

use async_trait::async_trait;
use thiserror::Error;

/// Errors talking to the coordination service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service is not reachable")]
    NotReachable,

    #[error("Invalid access token")]
    Unauthorized,

    #[error("API error: {0}")]
    Api(String),
}

/// Remote procedures the sync engine consumes.
///
/// Implementations must be cheap to call concurrently; the session issues
/// requests from spawned tasks and never holds a lock across a call.
#[async_trait]
pub trait GroupService: Send + Sync {
    /// Ask the service for its reception and transmission timestamps
    async fn probe_time(&self) -> Result<TimeProbe, ServiceError>;

    /// Fire a request at the service
    async fn send(&self, request: ServiceRequest) -> Result<(), ServiceError>;

    /// Fetch the authoritative state of the group this client belongs to
    async fn fetch_joined_state(&self) -> Result<JoinedState, ServiceError>;

    /// Resolve content item ids to playable items, in request order
    async fn resolve_items(&self, item_ids: &[String]) -> Result<Vec<MediaItem>, ServiceError>;
}
