//! Telemetry initialisation for the valve service.
//!
//! The relay uses a lightweight setup: structured JSON logs only.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the tracing subscriber for the valve service.
///
/// Outputs structured JSON logs to stdout at the configured log level;
/// `RUST_LOG` overrides the configured default.
///
/// # Errors
///
/// Returns an error if the subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise valve tracing subscriber: {e}"))
}
