//! Store-backed capacity router.

use super::{WorkerHeartbeat, WorkerRegistration, WorkerRouter, WorkerSnapshot};
use crate::error::{JobError, JobResult};
use crate::keys::StoreKeys;
use crate::metrics::RouterMetrics;
use crate::store::CoordinationStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routes to the worker with the most free slots.
///
/// Free slots live in a sorted set scored by free capacity; selection and
/// decrement are one atomic store operation, so concurrent dispatchers can
/// never oversubscribe a worker.
pub struct CapacityRouter {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
}

impl CapacityRouter {
    /// Creates a router.
    pub fn new(store: Arc<dyn CoordinationStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    async fn registration(&self, worker_id: &str) -> JobResult<Option<WorkerRegistration>> {
        match self.store.hget(&self.keys.worker_info(), worker_id).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn record_worker_count(&self) -> JobResult<()> {
        let count = self.store.zcard(&self.keys.worker_capacity()).await?;
        RouterMetrics::update_workers(self.strategy(), count as usize);
        Ok(())
    }

    /// Free slots currently recorded for a worker.
    pub async fn free_slots(&self, worker_id: &str) -> JobResult<Option<u32>> {
        Ok(self
            .store
            .zscore(&self.keys.worker_capacity(), worker_id)
            .await?
            .map(|score| score.max(0.0) as u32))
    }
}

#[async_trait]
impl WorkerRouter for CapacityRouter {
    fn strategy(&self) -> &'static str {
        "capacity"
    }

    async fn on_heartbeat(&self, heartbeat: WorkerHeartbeat) -> JobResult<()> {
        let now = Utc::now();
        let existing = self.registration(&heartbeat.worker_id).await?;
        let registration = WorkerRegistration {
            total_slots: heartbeat.total_slots,
            registered_at: existing.as_ref().map_or(now, |r| r.registered_at),
            last_heartbeat: now,
        };

        self.store
            .hset_and_zadd(
                &self.keys.worker_info(),
                &self.keys.worker_capacity(),
                &heartbeat.worker_id,
                &serde_json::to_string(&registration)?,
                f64::from(heartbeat.clamped_free()),
            )
            .await?;

        if existing.is_none() {
            info!(
                worker_id = %heartbeat.worker_id,
                total_slots = heartbeat.total_slots,
                "Worker registered"
            );
            self.record_worker_count().await?;
        } else {
            debug!(worker_id = %heartbeat.worker_id, free_slots = heartbeat.clamped_free(), "Worker heartbeat");
        }
        Ok(())
    }

    async fn acquire(&self) -> JobResult<String> {
        match self
            .store
            .acquire_highest_capacity(&self.keys.worker_capacity())
            .await?
        {
            Some(worker_id) => {
                debug!(worker_id = %worker_id, "Reserved worker slot");
                Ok(worker_id)
            }
            None => Err(JobError::NoCapacityAvailable),
        }
    }

    async fn release(&self, worker_id: &str) -> JobResult<()> {
        let Some(registration) = self.registration(worker_id).await? else {
            warn!(worker_id = %worker_id, "Release for unknown worker ignored");
            return Ok(());
        };

        match self
            .store
            .release_capacity(
                &self.keys.worker_capacity(),
                worker_id,
                f64::from(registration.total_slots),
            )
            .await?
        {
            Some(free) => debug!(worker_id = %worker_id, free_slots = free, "Released worker slot"),
            None => warn!(worker_id = %worker_id, "Release for disconnected worker ignored"),
        }
        Ok(())
    }

    async fn on_disconnect(&self, worker_id: &str) -> JobResult<()> {
        let removed = self
            .store
            .hdel_and_zrem(&self.keys.worker_info(), &self.keys.worker_capacity(), worker_id)
            .await?;

        if removed {
            info!(worker_id = %worker_id, "Worker disconnected");
            self.record_worker_count().await?;
        } else {
            warn!(worker_id = %worker_id, "Disconnect for unknown worker");
        }
        Ok(())
    }

    async fn workers(&self) -> JobResult<Vec<WorkerSnapshot>> {
        let registrations = self.store.hget_all(&self.keys.worker_info()).await?;
        let mut workers = Vec::with_capacity(registrations.len());

        for (worker_id, json) in registrations {
            let registration: WorkerRegistration = serde_json::from_str(&json)?;
            let free_slots = self.free_slots(&worker_id).await?.unwrap_or(0);
            workers.push(WorkerSnapshot {
                worker_id,
                free_slots,
                registration,
            });
        }

        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}
