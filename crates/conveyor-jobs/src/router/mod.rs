//! Worker capacity routing.
//!
//! Workers advertise free execution slots through heartbeats. A dispatcher
//! reserves one slot per job with [`WorkerRouter::acquire`] and gives it back
//! with [`WorkerRouter::release`] when the job finishes.

mod capacity;
mod simple;

pub use capacity::CapacityRouter;
pub use simple::SimpleRouter;

use crate::error::{JobError, JobResult};
use crate::metrics::RouterMetrics;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Absolute capacity report from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    /// Worker ID.
    pub worker_id: String,
    /// Slots free right now.
    pub free_slots: u32,
    /// Maximum concurrent jobs.
    pub total_slots: u32,
}

impl WorkerHeartbeat {
    /// Creates a heartbeat.
    pub fn new(worker_id: impl Into<String>, free_slots: u32, total_slots: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            free_slots,
            total_slots,
        }
    }

    /// Free slots, never above the total.
    pub fn clamped_free(&self) -> u32 {
        self.free_slots.min(self.total_slots)
    }
}

/// Persisted worker registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Maximum concurrent jobs.
    pub total_slots: u32,
    /// First heartbeat.
    pub registered_at: DateTime<Utc>,
    /// Most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Worker ID.
    pub worker_id: String,
    /// Slots free right now.
    pub free_slots: u32,
    /// Registration details.
    pub registration: WorkerRegistration,
}

/// Selects workers for dispatch.
#[async_trait]
pub trait WorkerRouter: Send + Sync {
    /// Strategy name for logs and metrics.
    fn strategy(&self) -> &'static str;

    /// Registers or refreshes a worker. The advertised free count replaces the stored one.
    async fn on_heartbeat(&self, heartbeat: WorkerHeartbeat) -> JobResult<()>;

    /// Reserves one slot and returns the worker it belongs to.
    ///
    /// Fails with `NoCapacityAvailable` when no worker has a free slot.
    async fn acquire(&self) -> JobResult<String>;

    /// Gives a slot back. Unknown workers are a logged no-op.
    async fn release(&self, worker_id: &str) -> JobResult<()>;

    /// Removes a worker from the routable set.
    async fn on_disconnect(&self, worker_id: &str) -> JobResult<()>;

    /// All registered workers.
    async fn workers(&self) -> JobResult<Vec<WorkerSnapshot>>;

    /// Like [`acquire`](Self::acquire), retrying with backoff for at most `wait`.
    async fn acquire_within(&self, wait: Duration) -> JobResult<String> {
        let started = Instant::now();
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(500))
            .with_max_elapsed_time(None)
            .build();

        loop {
            match self.acquire().await {
                Err(JobError::NoCapacityAvailable) => {}
                other => return other,
            }

            let waited = started.elapsed();
            if waited >= wait {
                RouterMetrics::capacity_exhausted(self.strategy());
                return Err(JobError::NoCapacityAvailable);
            }

            let pause = backoff
                .next_backoff()
                .unwrap_or(Duration::from_millis(500));
            tokio::time::sleep(pause.min(wait - waited)).await;
        }
    }

    /// Disconnects every worker whose last heartbeat is older than `max_age`.
    async fn evict_stale(&self, max_age: Duration) -> JobResult<Vec<String>> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };
        let mut evicted = Vec::new();

        for worker in self.workers().await? {
            if worker.registration.last_heartbeat < cutoff {
                tracing::warn!(
                    worker_id = %worker.worker_id,
                    last_heartbeat = %worker.registration.last_heartbeat,
                    "Evicting worker with stale heartbeat"
                );
                self.on_disconnect(&worker.worker_id).await?;
                evicted.push(worker.worker_id);
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evict_stale_keeps_fresh_workers() {
        let router = SimpleRouter::new();
        router.on_heartbeat(WorkerHeartbeat::new("w", 1, 1)).await.unwrap();

        assert!(router.evict_stale(Duration::from_secs(60)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.evict_stale(Duration::from_millis(1)).await.unwrap(), vec!["w".to_string()]);
        assert!(router.workers().await.unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_clamps_free_slots() {
        assert_eq!(WorkerHeartbeat::new("w", 9, 4).clamped_free(), 4);
        assert_eq!(WorkerHeartbeat::new("w", 2, 4).clamped_free(), 2);
    }
}
