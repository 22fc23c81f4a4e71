//! autopilot
//!
//! Runs one controller over an in-memory mirror seeded from a JSON file
//! and stops cleanly on SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use autopilot_controller::config::{self, Config};
use autopilot_controller::{lifecycle, Controller, InMemoryWatchSource, LoggingReconciler};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        workers = config.controller.workers,
        resync_secs = config.resync_interval.as_secs(),
        drain_timeout_secs = config.controller.drain_timeout.map(|d| d.as_secs()),
        "Starting autopilot controller"
    );

    let seed = match &config.seed_file {
        Some(path) => config::load_seed(path)?,
        None => Vec::new(),
    };
    info!(objects = seed.len(), "Seed loaded");

    // The feed stays alive for the life of the process; dropping it would
    // disconnect the source.
    let (source, _feed) = InMemoryWatchSource::new(seed, config.resync_interval);
    let source = Arc::new(source);
    let reconciler = Arc::new(LoggingReconciler::new(Arc::clone(&source)));

    let controller = Arc::new(Controller::new(
        "autopilot",
        source,
        reconciler,
        config.controller.clone(),
    ));

    lifecycle::run_until(controller, lifecycle::shutdown_signal()).await?;

    info!("autopilot stopped");
    Ok(())
}
