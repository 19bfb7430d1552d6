//! Telemetry and structured logging setup.
//!
//! Provides consistent logging across all components with:
//! - Symbol-tagged log lines (`[BTC/USDT] ...`) for filtering
//! - Structured JSON output for log aggregation
//! - Configurable verbosity via RUST_LOG
//!
//! Logs always go to stderr; stdout carries display events.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Filter used when RUST_LOG is unset.
pub const DEFAULT_FILTER: &str = "info,coin_watchdog=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initializes the telemetry/logging system.
///
/// Example RUST_LOG values:
/// - `info` - All info and above
/// - `coin_watchdog=debug` - Debug for our crate, default for others
/// - `coin_watchdog=trace,tokio_tungstenite=warn` - Trace for us, quiet sockets
pub fn init_telemetry() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initializes telemetry with JSON output (for production).
pub fn init_telemetry_json() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();
}
