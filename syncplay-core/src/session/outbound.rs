//! Ordered delivery of outbound service requests

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::service::{GroupService, ServiceRequest};

/// A request the service rejected or never received
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestFailure {
    pub request: &'static str,
    pub error: String,
}

/// Queue in front of the service. Requests are sent one at a time in the
/// order they were issued; failures are reported back to the session.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: mpsc::UnboundedSender<ServiceRequest>,
}

impl Outbound {
    pub fn start(service: Arc<dyn GroupService>, failures: mpsc::UnboundedSender<RequestFailure>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServiceRequest>();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let name = request.name();
                if let Err(e) = service.send(request).await {
                    warn!("Request {} failed: {}", name, e);
                    let _ = failures.send(RequestFailure {
                        request: name,
                        error: e.to_string(),
                    });
                }
            }
            debug!("Outbound request queue closed");
        });

        Self { tx }
    }

    pub fn send(&self, request: ServiceRequest) {
        debug!("Queueing {}", request.name());
        if self.tx.send(request).is_err() {
            warn!("Outbound request queue is closed");
        }
    }
}
