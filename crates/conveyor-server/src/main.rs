//! # Conveyor Server
//!
//! Runs the maintenance side of the dispatch core for the configured
//! backend: schema migration at startup, then the delayed/schedule pump and
//! stale-worker eviction until SIGINT or SIGTERM.

use conveyor_config::ConfigLoader;
use conveyor_core::init_logging;
use conveyor_jobs::{register_metrics, DispatchCore, JobError};
use conveyor_server::startup::{print_startup_info, shutdown_signal};
use conveyor_server::{MaintenanceLoop, ServerConfig};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be up yet when configuration fails to load.
        eprintln!("Application error: {e:#}");
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let loader: ConfigLoader<ServerConfig> = ConfigLoader::from_default_location()?;
    let config = loader.get().await;

    init_logging(&config.logging);
    register_metrics();

    info!("Starting Conveyor Server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    print_startup_info(&config);

    let core = Arc::new(DispatchCore::build(&config.jobs).await?);
    core.queue().init().await?;

    match core.migrate().await {
        Ok(report) => info!(
            scanned = report.scanned,
            upgraded = report.upgraded,
            requeued = report.requeued,
            skipped = report.skipped,
            "Schema migration finished"
        ),
        // Another instance holds the sweep lock and is migrating.
        Err(e @ JobError::LockTimeout { .. }) => {
            warn!(error = %e, "Skipping schema migration");
        }
        Err(e) => return Err(e.into()),
    }

    MaintenanceLoop::new(core.clone())
        .run(shutdown_signal())
        .await;

    core.queue().close().await?;
    info!("Server shutdown complete");
    Ok(())
}
