//! Structured logging init.
//!
//! Built on `tracing`: GMT nodes log to stderr with a `node` field attached
//! to every event, and each worker/helper/comm thread opens a span naming
//! its role so interleaved multi-thread logs stay readable.

use tracing_subscriber::EnvFilter;

/// Initialise the global `tracing` subscriber. Safe to call more than once
/// per process (e.g. from tests); later calls are no-ops.
pub fn init(node_id: u32) {
    let filter = EnvFilter::try_from_env("GMT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
    tracing::info!(node_id, "gmt logging initialised");
}

/// A span to enter for the lifetime of a worker/helper/comm-server thread.
pub fn role_span(node_id: u32, role: &'static str, index: u32) -> tracing::Span {
    tracing::info_span!("thread", node_id, role, index)
}
