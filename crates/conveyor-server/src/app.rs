//! Server configuration and maintenance loop.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use conveyor_config::ValidateConfig;
use conveyor_core::{ConveyorError, ConveyorResult, LoggingConfig};
use conveyor_jobs::{DispatchCore, JobResult, JobsConfig, PumpReport};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Top-level configuration of the server binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Application identity.
    #[serde(default)]
    pub app: AppSettings,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatch core.
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl ValidateConfig for ServerConfig {
    fn validate(&self) -> ConveyorResult<()> {
        if self.app.name.trim().is_empty() {
            return Err(ConveyorError::configuration("app.name must not be empty"));
        }
        self.jobs
            .validate()
            .map_err(|e| ConveyorError::configuration(e.to_string()))
    }
}

/// Application identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Name reported in logs.
    #[serde(default = "default_name")]
    pub name: String,

    /// Deployment environment label.
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            environment: default_environment(),
        }
    }
}

fn default_name() -> String {
    "conveyor".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Queue movement.
    pub pump: PumpReport,
    /// Workers disconnected for a stale heartbeat.
    pub evicted: Vec<String>,
}

/// Periodically pumps the queues and evicts silent workers.
pub struct MaintenanceLoop {
    core: Arc<DispatchCore>,
    interval: Duration,
    heartbeat_timeout: Duration,
    max_backoff: Duration,
}

impl MaintenanceLoop {
    /// Creates a loop using the core's dispatcher and router settings.
    pub fn new(core: Arc<DispatchCore>) -> Self {
        let config = core.config();
        let interval = config.dispatcher.poll_interval();
        let heartbeat_timeout = config.router.heartbeat_timeout();
        let max_backoff = config.dispatcher.max_backend_backoff();
        Self {
            core,
            interval,
            heartbeat_timeout,
            max_backoff,
        }
    }

    /// Overrides the heartbeat age after which workers are evicted.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Runs one pass at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> JobResult<MaintenanceReport> {
        let pump = self.core.queue().pump(now).await?;
        let evicted = self.core.router().evict_stale(self.heartbeat_timeout).await?;
        Ok(MaintenanceReport { pump, evicted })
    }

    /// Runs passes until `shutdown` completes.
    ///
    /// An unreachable backend pauses the loop with exponential backoff;
    /// other failures are logged and the next pass runs on schedule.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.interval)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build();
        let mut pause = Duration::ZERO;

        info!(interval_ms = self.interval.as_millis() as u64, "Maintenance loop started");

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(pause) => {}
            }

            pause = match self.tick(Utc::now()).await {
                Ok(report) => {
                    backoff.reset();
                    if !report.evicted.is_empty() {
                        info!(evicted = ?report.evicted, "Disconnected stale workers");
                    }
                    self.interval
                }
                Err(e) if e.is_backend_unavailable() => {
                    let pause = backoff.next_backoff().unwrap_or(self.max_backoff);
                    warn!(
                        error = %e,
                        pause_ms = pause.as_millis() as u64,
                        "Backend unavailable, pausing maintenance"
                    );
                    pause
                }
                Err(e) => {
                    error!(error = %e, "Maintenance pass failed");
                    self.interval
                }
            };
        }

        info!("Maintenance loop stopped");
    }
}
