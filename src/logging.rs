//! Logging configuration using tracing
//!
//! Logs go to stderr so stdout stays reserved for JSON responses.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Error returned when a global subscriber is already installed
#[derive(Debug, Error)]
#[error("Failed to initialize tracing: {0}")]
pub struct LoggingError(String);

/// Initialize the tracing subscriber
///
/// Filtering follows `RUST_LOG`, defaulting to `warn`. Cache hits, misses and
/// joins are logged at `debug`, e.g. `RUST_LOG=stockroom=debug`.
pub fn init() -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| LoggingError(e.to_string()))
}
