//! Tracing setup for embedders

use std::sync::Once;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG`, with debug
/// output for this crate. Only the first call has an effect.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::from_default_env()
            .add_directive(directive("syncplay_core=debug"))
            .add_directive(directive("hyper_util=off"))
            .add_directive(directive("reqwest=off"))
            .add_directive(directive("hyper=off"));

        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Built-in directive, `info` if mistyped
fn directive(spec: &str) -> Directive {
    spec.parse().unwrap_or_else(|_| LevelFilter::INFO.into())
}
