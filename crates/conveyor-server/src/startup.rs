//! Server startup utilities.

use crate::app::ServerConfig;
use tokio::signal;
use tracing::{info, warn};

/// Logs the resolved configuration at startup.
pub fn print_startup_info(config: &ServerConfig) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Application:  {} ({})", config.app.name, config.app.environment);
    info!("Backend:      {:?}", config.jobs.mode);
    info!("Key prefix:   {}", config.jobs.redis.key_prefix);
    info!("Routing:      {:?}", config.jobs.router.strategy);
    info!(
        "Admission:    {} per tenant (enabled: {})",
        config.jobs.admission.max_concurrent_per_tenant, config.jobs.admission.enabled
    );
    info!("{}", separator);
}

/// Completes on Ctrl+C or, on Unix, SIGTERM.
///
/// A handler that cannot be installed is logged and never fires, so the
/// other signal still stops the server.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_startup_info_does_not_panic() {
        conveyor_core::init_logging(&conveyor_core::LoggingConfig::default());
        print_startup_info(&ServerConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_waits_for_a_signal() {
        let fired = tokio::time::timeout(std::time::Duration::from_secs(1), shutdown_signal()).await;
        assert!(fired.is_err());
    }
}
