//! # Beacon Server
//!
//! Distributed real-time event broadcast server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with environment variables
//! BEACON_PORT=8080 BEACON_BUS_URL=redis://redis:6379 beacon
//! ```

mod config;
mod handlers;
mod metrics;
mod redis_bus;

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Beacon instance {} on {}:{}",
        config.instance_id,
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // A crash marker still present from the previous run, or the
    // supervisor's flag, means the prior shutdown was abnormal.
    let marker: PathBuf = shellexpand::tilde(&config.recovery.marker_path)
        .as_ref()
        .into();
    let crashed = std::env::var("BEACON_CRASHED").map(|v| v == "1").unwrap_or(false)
        || marker.exists();
    if let Err(e) = std::fs::write(&marker, config.instance_id.as_bytes()) {
        tracing::warn!(path = %marker.display(), error = %e, "Failed to write crash marker");
    }

    // Start the server
    handlers::run_server(config, crashed).await?;

    // Clean shutdown: drop the marker so the next start is quiet.
    let _ = std::fs::remove_file(&marker);

    Ok(())
}
