//! Relay service binary.
//!
//! Loads the configuration, sets up logging and metrics and runs the orchestrator until the
//! process is asked to stop.

use relay_telemetry::metrics::init_metrics;
use relay_telemetry::tracing::init_tracing;
use tracing::{error, info};

use crate::config::load_relay_config;
use crate::core::start_relay_with_config;

mod config;
mod core;

fn main() -> anyhow::Result<()> {
    let config = load_relay_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            // The exporter spawns its listener on the runtime, so it is installed from within it.
            if let Some(metrics) = &config.metrics {
                init_metrics(metrics.port, None)?;
                info!(port = metrics.port, "metrics endpoint is listening");
            }

            if let Err(err) = start_relay_with_config(config).await {
                error!(error = %err, "relay stopped with an error");

                return Err(err);
            }

            Ok(())
        })
}
