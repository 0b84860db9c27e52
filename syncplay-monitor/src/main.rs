//! SyncPlay Monitor
//!
//! Follows the group you are in with a simulated player and shows clock,
//! drift and group state in a terminal dashboard.
//!
//! Usage:
//!   cargo run --release -- --server http://media.local:8096 --token <token>
//!   cargo run --release -- --server ... --profile aggressive
//!   cargo run --release -- --server ... --no-dashboard  # Plain logging mode

mod dashboard;
mod metrics;
mod player;
mod session;

use clap::Parser;
use parking_lot::RwLock;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = session::Options::parse();

    if options.dashboard() {
        let metrics = Arc::new(RwLock::new(metrics::Metrics::new(options.server.clone())));
        let connection = session::connect(&options).await?;
        dashboard::run(connection, metrics).await
    } else {
        session::run_with_logging(&options).await
    }
}
