//! Telemetry initialization for the Skerry daemon.
//!
//! Console tracing via `tracing-subscriber`, filtered by `RUST_LOG` or
//! the configured level.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. Call once at startup, before any
/// `tracing` events are emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
