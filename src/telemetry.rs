//! Logging initialisation.
//!
//! Metrics emission is explicitly out of scope for this process, so unlike
//! a full OpenTelemetry setup, there is no meter/tracer configuration
//! here — just a plain `tracing-subscriber` filter built from the
//! configured log directive.

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

/// Initialises the global `tracing` subscriber from `filter_directive`
/// (typically the `RUST_LOG`-style string from `Config::log_filter`).
pub fn init(filter_directive: &str) {
    let filter = EnvFilter::try_new(filter_directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// HTTP request/response tracing layer for the axum router.
pub fn http_tracing() -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}
