//! Job completion handling.

use super::{millis, QueueManager};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::metrics::JobMetrics;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// How a dispatched job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum JobOutcome {
    /// The executor finished the job.
    Succeeded,
    /// The executor reported a failure.
    Failed {
        /// Failure description.
        error: String,
        /// Whether another attempt may succeed.
        retryable: bool,
    },
    /// The worker disconnected before it could run the job.
    WorkerLost,
    /// The dispatcher gave up on the job without an outcome: it was still
    /// running at shutdown, or its report never arrived.
    Abandoned,
}

/// Completion report for a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinished {
    /// Job ID.
    pub job_id: JobId,
    /// Worker that held the slot.
    pub worker_id: String,
    /// Outcome.
    pub outcome: JobOutcome,
}

impl JobFinished {
    /// Successful completion.
    pub fn succeeded(job_id: JobId, worker_id: impl Into<String>) -> Self {
        Self {
            job_id,
            worker_id: worker_id.into(),
            outcome: JobOutcome::Succeeded,
        }
    }

    /// Failed completion.
    pub fn failed(job_id: JobId, worker_id: impl Into<String>, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            job_id,
            worker_id: worker_id.into(),
            outcome: JobOutcome::Failed {
                error: error.into(),
                retryable,
            },
        }
    }

    /// The worker disappeared before running the job.
    pub fn worker_lost(job_id: JobId, worker_id: impl Into<String>) -> Self {
        Self {
            job_id,
            worker_id: worker_id.into(),
            outcome: JobOutcome::WorkerLost,
        }
    }

    /// The job was given up without an outcome.
    pub fn abandoned(job_id: JobId, worker_id: impl Into<String>) -> Self {
        Self {
            job_id,
            worker_id: worker_id.into(),
            outcome: JobOutcome::Abandoned,
        }
    }
}

impl QueueManager {
    /// Handles a finished job: frees the worker slot, gives the admission unit
    /// back, retries or drops the job, and promotes the next parked job of the
    /// same tenant and class.
    ///
    /// Reports for unknown jobs, for jobs no longer dispatched, or from a
    /// worker that does not hold the job are ignored with a warning.
    pub async fn finish(&self, finished: JobFinished) -> JobResult<()> {
        self.settle(finished).await.map(|_| ())
    }

    /// Like [`finish`](Self::finish), returning true when this report took effect.
    ///
    /// Removing the job from the dispatched index is the claim: of two
    /// concurrent reports for one dispatch only the one whose removal
    /// succeeded applies side effects. If applying them fails the job is
    /// indexed again, so the stalled-dispatch recovery retries it.
    pub(crate) async fn settle(&self, finished: JobFinished) -> JobResult<bool> {
        let JobFinished {
            job_id,
            worker_id,
            outcome,
        } = finished;

        let Some(record) = self.load(&job_id).await? else {
            warn!(
                job_id = %job_id,
                error = %JobError::JobNotFound(job_id.to_string()),
                "Completion for unknown job ignored"
            );
            return Ok(false);
        };
        if record.state != JobState::Dispatched {
            warn!(job_id = %job_id, state = %record.state, "Completion for job that is not dispatched ignored");
            return Ok(false);
        }
        if record.worker_id.as_deref() != Some(worker_id.as_str()) {
            warn!(
                job_id = %job_id,
                worker_id = %worker_id,
                holder = ?record.worker_id,
                "Completion from a worker that does not hold the job ignored"
            );
            return Ok(false);
        }

        let dispatched_key = self.keys.dispatched();
        if !self.store.zrem(&dispatched_key, job_id.as_str()).await? {
            debug!(job_id = %job_id, "Completion already recorded");
            return Ok(false);
        }

        let dispatched_at = record.dispatched_at;
        if let Err(e) = self.apply(record, &worker_id, outcome).await {
            let score = dispatched_at.map_or(0.0, millis);
            if let Err(reindex) = self.store.zadd(&dispatched_key, job_id.as_str(), score).await {
                error!(job_id = %job_id, error = %reindex, "Failed to re-index unfinished completion");
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn apply(&self, record: JobRecord, worker_id: &str, outcome: JobOutcome) -> JobResult<()> {
        let job_id = record.id.clone();
        if outcome == JobOutcome::WorkerLost {
            warn!(job_id = %job_id, worker_id = %worker_id, "Worker lost, slot not released");
        } else {
            self.router.release(worker_id).await?;
        }

        self.admission
            .change_count(record.class, &record.tenant_id, -1)
            .await?;
        let tenant_id = record.tenant_id.clone();
        let class = record.class;

        match outcome {
            JobOutcome::Succeeded => {
                let duration = record
                    .dispatched_at
                    .and_then(|at| (Utc::now() - at).to_std().ok());
                self.store.delete(&self.keys.job(&job_id)).await?;
                JobMetrics::job_completed(record.class, duration);
                info!(job_id = %job_id, worker_id = %worker_id, "Job completed");
            }
            JobOutcome::Failed { error, retryable } => {
                self.handle_failure(record, error, retryable).await?;
            }
            JobOutcome::WorkerLost | JobOutcome::Abandoned => {
                let mut record = record;
                record.attempt = record.attempt.saturating_sub(1);
                record.worker_id = None;
                record.dispatched_at = None;
                debug!(job_id = %job_id, "Re-admitting job without an outcome");
                self.admit(record).await?;
            }
        }

        self.promote(&tenant_id, class).await?;
        Ok(())
    }

    async fn handle_failure(&self, mut record: JobRecord, error: String, retryable: bool) -> JobResult<()> {
        if retryable && self.retry.should_retry(record.attempt, Some(record.max_attempts)) {
            let delay = self.retry.delay_for_attempt(record.attempt);
            let now = Utc::now();

            record.state = JobState::Delayed;
            record.visible_at = now + ChronoDuration::from_std(delay).unwrap_or_default();
            record.worker_id = None;
            record.dispatched_at = None;
            record.last_error = Some(error);
            self.save(&record).await?;
            self.store
                .zadd(&self.keys.delayed(), record.id.as_str(), millis(record.visible_at))
                .await?;

            JobMetrics::job_retried(record.class, record.attempt);
            warn!(
                job_id = %record.id,
                attempt = record.attempt,
                max_attempts = record.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Job failed, scheduling retry"
            );
            return Ok(());
        }

        self.store.delete(&self.keys.job(&record.id)).await?;
        JobMetrics::job_failed(record.class);
        error!(
            job_id = %record.id,
            attempt = record.attempt,
            error = %error,
            "Job failed permanently"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::AdmissionConfig;
    use crate::job::{JobClass, JobSpec};
    use crate::keys::StoreKeys;
    use crate::retry::RetryPolicy;
    use crate::router::{CapacityRouter, WorkerHeartbeat, WorkerRouter};
    use crate::store::{CoordinationStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        manager: QueueManager,
        router: Arc<CapacityRouter>,
    }

    fn harness(ceiling: u32) -> Harness {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let keys = StoreKeys::new("t");
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            keys.clone(),
            AdmissionConfig {
                max_concurrent_per_tenant: ceiling,
                ..AdmissionConfig::default()
            },
        ));
        let router = Arc::new(CapacityRouter::new(store.clone(), keys.clone()));
        let manager = QueueManager::new(
            store,
            keys,
            admission,
            router.clone(),
            RetryPolicy::default(),
            100,
        );
        Harness { manager, router }
    }

    async fn dispatch(h: &Harness) -> JobRecord {
        let worker = h.router.acquire().await.unwrap();
        h.manager
            .dequeue(&["one_time".to_string()], &worker)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_releases_everything() {
        let h = harness(5);
        h.router.on_heartbeat(WorkerHeartbeat::new("w", 2, 2)).await.unwrap();
        let added = h.manager.add(JobSpec::one_time("acme", json!({}))).await.unwrap();
        let job = dispatch(&h).await;

        h.manager
            .finish(JobFinished::succeeded(job.id.clone(), "w"))
            .await
            .unwrap();

        assert!(h.manager.get(&added.job_id).await.unwrap().is_none());
        assert_eq!(h.router.free_slots("w").await.unwrap(), Some(2));
        assert_eq!(
            h.manager.admission().in_flight(JobClass::OneTime, "acme").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_is_delayed() {
        let h = harness(5);
        h.router.on_heartbeat(WorkerHeartbeat::new("w", 1, 1)).await.unwrap();
        h.manager.add(JobSpec::one_time("acme", json!({}))).await.unwrap();
        let job = dispatch(&h).await;

        h.manager
            .finish(JobFinished::failed(job.id.clone(), "w", "timeout", true))
            .await
            .unwrap();

        let record = h.manager.get(&job.id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.last_error.as_deref(), Some("timeout"));
        assert!(record.visible_at > Utc::now() + ChronoDuration::minutes(7));
        assert_eq!(h.manager.delayed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_failure_is_dropped() {
        let h = harness(5);
        h.router.on_heartbeat(WorkerHeartbeat::new("w", 1, 1)).await.unwrap();
        h.manager
            .add(JobSpec::one_time("acme", json!({})).max_attempts(1))
            .await
            .unwrap();
        let job = dispatch(&h).await;

        h.manager
            .finish(JobFinished::failed(job.id.clone(), "w", "boom", true))
            .await
            .unwrap();

        assert!(h.manager.get(&job.id).await.unwrap().is_none());
        assert_eq!(h.manager.delayed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_dropped() {
        let h = harness(5);
        h.router.on_heartbeat(WorkerHeartbeat::new("w", 1, 1)).await.unwrap();
        h.manager.add(JobSpec::one_time("acme", json!({}))).await.unwrap();
        let job = dispatch(&h).await;

        h.manager
            .finish(JobFinished::failed(job.id.clone(), "w", "bad input", false))
            .await
            .unwrap();
        assert!(h.manager.get(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_lost_requeues_without_using_attempt() {
        let h = harness(5);
        h.router.on_heartbeat(WorkerHeartbeat::new("w", 1, 1)).await.unwrap();
        h.manager.add(JobSpec::one_time("acme", json!({}))).await.unwrap();
        let job = dispatch(&h).await;
        h.router.on_disconnect("w").await.unwrap();

        h.manager
            .finish(JobFinished::worker_lost(job.id.clone(), "w"))
            .await
            .unwrap();

        let record = h.manager.get(&job.id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.attempt, 0);
        assert_eq!(h.manager.queue_length("one_time").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completion_promotes_parked_job() {
        let h = harness(1);
        h.router.on_heartbeat(WorkerHeartbeat::new("w", 2, 2)).await.unwrap();
        h.manager.add(JobSpec::one_time("acme", json!({})).id("a")).await.unwrap();
        h.manager.add(JobSpec::one_time("acme", json!({})).id("b")).await.unwrap();

        let job = dispatch(&h).await;
        assert_eq!(job.id.as_str(), "a");
        assert_eq!(h.manager.queue_length("one_time").await.unwrap(), 0);

        h.manager
            .finish(JobFinished::succeeded(job.id, "w"))
            .await
            .unwrap();

        let promoted = h.manager.get(&JobId::from("b")).await.unwrap().unwrap();
        assert_eq!(promoted.state, JobState::Queued);
        assert_eq!(h.manager.queue_length("one_time").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_completion_is_noop() {
        let h = harness(1);
        h.manager
            .finish(JobFinished::succeeded(JobId::from("ghost"), "w"))
            .await
            .unwrap();
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(JobOutcome::Failed {
            error: "x".into(),
            retryable: true,
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
    }
}
