//! `valve` — relay service binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from the optional TOML file named by
//!    `VALVE_CONFIG` plus `VALVE_`-prefixed environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Set up and start the [`ValveService`]; run until interrupted.

use anyhow::Result;
use tracing::info;
use valve::{Config, FilterRegistry, ValveService};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let config_path = std::env::var("VALVE_CONFIG").ok();
    let cfg = Config::load(config_path.as_deref()).map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: valve configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    valve::telemetry::init(&cfg.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "valve starting");

    // -----------------------------------------------------------------------
    // 3. Service
    // -----------------------------------------------------------------------
    // Embedders register their filter implementations here; configuration
    // references them by identifier.
    let registry = FilterRegistry::new();

    let mut service = ValveService::new(cfg, registry)?;
    service.set_up().await?;
    service.start().await?;

    // -----------------------------------------------------------------------
    // 4. Shutdown
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    service.stop().await;

    Ok(())
}
