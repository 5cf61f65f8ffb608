//! Tracing initialization. The teacher carries `tracing` + `tracing-subscriber`
//! as dependencies for exactly this purpose; the gateway has no HTTP surface
//! to export Prometheus metrics from, so only the logging half of the
//! teacher's observability module survives here (see `DESIGN.md`).

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber from `RUST_LOG`, defaulting to
/// `info` when unset. Call once, at process start.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
