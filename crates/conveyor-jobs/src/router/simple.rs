//! In-process router without capacity accounting.

use super::{WorkerHeartbeat, WorkerRegistration, WorkerRouter, WorkerSnapshot};
use crate::error::{JobError, JobResult};
use crate::metrics::RouterMetrics;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

/// Returns the most recently registered worker for every dispatch.
///
/// Free counts are recorded for monitoring but never decremented. Only
/// suitable when a single process dispatches.
#[derive(Default)]
pub struct SimpleRouter {
    workers: RwLock<Vec<WorkerSnapshot>>,
}

impl SimpleRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRouter for SimpleRouter {
    fn strategy(&self) -> &'static str {
        "simple"
    }

    async fn on_heartbeat(&self, heartbeat: WorkerHeartbeat) -> JobResult<()> {
        let now = Utc::now();
        let mut workers = self.workers.write();

        if let Some(worker) = workers.iter_mut().find(|w| w.worker_id == heartbeat.worker_id) {
            worker.free_slots = heartbeat.clamped_free();
            worker.registration.total_slots = heartbeat.total_slots;
            worker.registration.last_heartbeat = now;
            return Ok(());
        }

        info!(worker_id = %heartbeat.worker_id, "Worker registered");
        workers.push(WorkerSnapshot {
            free_slots: heartbeat.clamped_free(),
            registration: WorkerRegistration {
                total_slots: heartbeat.total_slots,
                registered_at: now,
                last_heartbeat: now,
            },
            worker_id: heartbeat.worker_id,
        });
        RouterMetrics::update_workers(self.strategy(), workers.len());
        Ok(())
    }

    async fn acquire(&self) -> JobResult<String> {
        self.workers
            .read()
            .last()
            .map(|w| w.worker_id.clone())
            .ok_or(JobError::NoCapacityAvailable)
    }

    async fn release(&self, worker_id: &str) -> JobResult<()> {
        if !self.workers.read().iter().any(|w| w.worker_id == worker_id) {
            warn!(worker_id = %worker_id, "Release for unknown worker ignored");
        }
        Ok(())
    }

    async fn on_disconnect(&self, worker_id: &str) -> JobResult<()> {
        let mut workers = self.workers.write();
        let before = workers.len();
        workers.retain(|w| w.worker_id != worker_id);

        if workers.len() < before {
            info!(worker_id = %worker_id, "Worker disconnected");
            RouterMetrics::update_workers(self.strategy(), workers.len());
        } else {
            warn!(worker_id = %worker_id, "Disconnect for unknown worker");
        }
        Ok(())
    }

    async fn workers(&self) -> JobResult<Vec<WorkerSnapshot>> {
        Ok(self.workers.read().clone())
    }
}
