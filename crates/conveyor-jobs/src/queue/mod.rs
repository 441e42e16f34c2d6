//! Queue manager: the producer, dispatcher and completion entry point.
//!
//! Layout in the coordination store:
//!
//! ```text
//! job:{id}            JSON record, the single source of truth for a job
//! queue:{name}        visible jobs, scored by priority then visibility
//! delayed             hidden jobs, scored by visibility time
//! parked:{class}:{t}  jobs held back by admission, scored by park order
//! parked_index        non-empty parked sets, as class:tenant members
//! schedules           repeating schedules, scored by next fire time
//! dispatched          jobs handed to a worker, scored by dispatch time
//! ```
//!
//! A job id lives in at most one of the sets at a time. Every move between
//! sets starts with a `zrem`; only the caller whose `zrem` succeeded carries
//! the move on, so concurrent pumps and cancellations never double-move a job.

mod completion;
mod pump;

pub use completion::{JobFinished, JobOutcome};
pub use pump::PumpReport;

use crate::admission::AdmissionController;
use crate::error::{JobError, JobResult};
use crate::job::{AddOutcome, Disposition, JobClass, JobId, JobRecord, JobSpec, JobState};
use crate::keys::StoreKeys;
use crate::metrics::JobMetrics;
use crate::retry::RetryPolicy;
use crate::router::WorkerRouter;
use crate::store::CoordinationStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default age after which an unreported dispatch is recovered.
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(660);

/// Accepts, cancels, dispatches and completes jobs.
pub struct QueueManager {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    admission: Arc<AdmissionController>,
    router: Arc<dyn WorkerRouter>,
    retry: RetryPolicy,
    pump_batch_size: usize,
    stall_timeout: Duration,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl QueueManager {
    /// Creates a queue manager.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: StoreKeys,
        admission: Arc<AdmissionController>,
        router: Arc<dyn WorkerRouter>,
        retry: RetryPolicy,
        pump_batch_size: usize,
    ) -> Self {
        Self {
            store,
            keys,
            admission,
            router,
            retry,
            pump_batch_size: pump_batch_size.max(1),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets how long a dispatched job may go without a completion report
    /// before the pump hands it back to the queue.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Checks the backend connection. Safe to call more than once.
    pub async fn init(&self) -> JobResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.store.ping().await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.closed.store(false, Ordering::SeqCst);
        info!(backend = self.store.backend(), "Queue manager initialized");
        Ok(())
    }

    /// Stops accepting new jobs. Safe to call more than once.
    pub async fn close(&self) -> JobResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!(backend = self.store.backend(), "Queue manager closed");
        Ok(())
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> JobResult<()> {
        if self.is_closed() {
            return Err(JobError::Configuration("queue manager is closed".into()));
        }
        Ok(())
    }

    /// Admission controller shared with this manager.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Worker router shared with this manager.
    pub fn router(&self) -> &Arc<dyn WorkerRouter> {
        &self.router
    }

    /// Adds a job.
    ///
    /// Repeating jobs are upserted by id. Any other class fails with
    /// `DuplicateJob` when the id is taken.
    pub async fn add(&self, spec: JobSpec) -> JobResult<AddOutcome> {
        self.ensure_open()?;

        let now = Utc::now();
        let record = spec.into_record(now, self.retry.max_attempts)?;

        let disposition = match record.class {
            JobClass::Repeating => self.upsert_schedule(record.clone()).await?,
            _ => self.create(record.clone(), now).await?,
        };

        JobMetrics::job_added(record.class, disposition.as_str());
        Ok(AddOutcome {
            job_id: record.id,
            disposition,
        })
    }

    async fn create(&self, record: JobRecord, now: DateTime<Utc>) -> JobResult<Disposition> {
        let key = self.keys.job(&record.id);
        if !self.store.set_nx(&key, &record.to_json()?, None).await? {
            return Err(JobError::DuplicateJob(record.id.to_string()));
        }

        if record.state == JobState::Delayed && record.visible_at > now {
            self.store
                .zadd(&self.keys.delayed(), record.id.as_str(), millis(record.visible_at))
                .await?;
            debug!(job_id = %record.id, visible_at = %record.visible_at, "Delayed job");
            return Ok(Disposition::Delayed);
        }

        self.admit(record).await
    }

    async fn upsert_schedule(&self, record: JobRecord) -> JobResult<Disposition> {
        let key = self.keys.job(&record.id);
        let json = record.to_json()?;

        let disposition = if self.store.set_nx(&key, &json, None).await? {
            info!(job_id = %record.id, next_fire = %record.visible_at, "Registered repeating schedule");
            Disposition::Scheduled
        } else {
            let existing = self.load(&record.id).await?;
            match existing {
                Some(existing) if existing.state == JobState::Scheduled => {
                    let mut updated = record.clone();
                    updated.created_at = existing.created_at;
                    self.save(&updated).await?;
                    info!(job_id = %record.id, next_fire = %record.visible_at, "Updated repeating schedule");
                    Disposition::Rescheduled
                }
                Some(_) => return Err(JobError::DuplicateJob(record.id.to_string())),
                None => {
                    self.save(&record).await?;
                    Disposition::Scheduled
                }
            }
        };

        self.store
            .zadd(&self.keys.schedules(), record.id.as_str(), millis(record.visible_at))
            .await?;
        Ok(disposition)
    }

    /// Makes a job visible, or parks it when its tenant is at the ceiling.
    pub(crate) async fn admit(&self, mut record: JobRecord) -> JobResult<Disposition> {
        if self
            .admission
            .should_limit(record.class, &record.tenant_id)
            .await?
        {
            record.state = JobState::Parked;
            self.save(&record).await?;
            self.admission.park(&record).await?;

            // A job finishing between the limit check and the park would
            // leave this one stranded; look again now that it is parked.
            self.promote(&record.tenant_id, record.class).await?;
            return Ok(Disposition::Parked);
        }

        self.activate(record, Utc::now()).await?;
        Ok(Disposition::Queued)
    }

    /// Puts an admitted job into its active queue.
    async fn activate(&self, mut record: JobRecord, now: DateTime<Utc>) -> JobResult<()> {
        record.state = JobState::Queued;
        record.visible_at = now;
        record.worker_id = None;
        record.dispatched_at = None;
        self.save(&record).await?;

        self.store
            .zadd(
                &self.keys.queue(record.queue_name()),
                record.id.as_str(),
                record.priority.score(record.visible_at),
            )
            .await?;
        debug!(job_id = %record.id, queue = record.queue_name(), priority = %record.priority, "Enqueued job");
        Ok(())
    }

    /// Moves the oldest parked job of a tenant and class into its active queue
    /// if admission allows.
    pub async fn promote(&self, tenant_id: &str, class: JobClass) -> JobResult<Option<JobId>> {
        match self.admission.promote(tenant_id, class).await? {
            Some(record) => {
                let job_id = record.id.clone();
                self.activate(record, Utc::now()).await?;
                Ok(Some(job_id))
            }
            None => Ok(None),
        }
    }

    /// Cancels a job that has not been dispatched.
    ///
    /// Returns false, with a warning, when the job is unknown or already
    /// owned by a worker. A repeating schedule is cancelled as a whole.
    pub async fn remove(&self, job_id: &JobId) -> JobResult<bool> {
        let Some(record) = self.load(job_id).await? else {
            warn!(job_id = %job_id, error = %JobError::JobNotFound(job_id.to_string()), "Remove ignored");
            return Ok(false);
        };

        let removed = match record.state {
            JobState::Dispatched => false,
            JobState::Scheduled => self.store.zrem(&self.keys.schedules(), job_id.as_str()).await?,
            _ => {
                if self
                    .store
                    .zrem(&self.keys.queue(record.queue_name()), job_id.as_str())
                    .await?
                {
                    self.store.delete(&self.keys.job(job_id)).await?;
                    self.admission
                        .change_count(record.class, &record.tenant_id, -1)
                        .await?;
                    self.promote(&record.tenant_id, record.class).await?;
                    JobMetrics::job_removed(record.class);
                    info!(job_id = %job_id, "Removed queued job");
                    return Ok(true);
                }
                self.store.zrem(&self.keys.delayed(), job_id.as_str()).await?
                    || self
                        .admission
                        .unpark(&record.tenant_id, record.class, job_id)
                        .await?
            }
        };

        if !removed {
            warn!(job_id = %job_id, state = %record.state, "Remove ignored, job is dispatched or in transit");
            return Ok(false);
        }

        self.store.delete(&self.keys.job(job_id)).await?;
        JobMetrics::job_removed(record.class);
        info!(job_id = %job_id, state = %record.state, "Removed job");
        Ok(true)
    }

    /// Pops the next visible job from `queues`, in order, for `worker_id`.
    ///
    /// The caller must already hold a slot on that worker.
    pub async fn dequeue(&self, queues: &[String], worker_id: &str) -> JobResult<Option<JobRecord>> {
        for queue in queues {
            while let Some((id, _)) = self.store.zpop_min(&self.keys.queue(queue)).await? {
                let job_id = JobId::from(id);
                let Some(mut record) = self.load(&job_id).await? else {
                    warn!(job_id = %job_id, queue = %queue, "Queued job has no record, dropping");
                    continue;
                };

                let now = Utc::now();
                record.state = JobState::Dispatched;
                record.attempt += 1;
                record.worker_id = Some(worker_id.to_string());
                record.dispatched_at = Some(now);
                self.store
                    .zadd(&self.keys.dispatched(), record.id.as_str(), millis(now))
                    .await?;
                self.save(&record).await?;

                JobMetrics::job_dispatched(queue);
                debug!(
                    job_id = %record.id,
                    worker_id = %worker_id,
                    attempt = record.attempt,
                    "Dispatched job"
                );
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Loads a job record.
    pub async fn get(&self, job_id: &JobId) -> JobResult<Option<JobRecord>> {
        self.load(job_id).await
    }

    /// Number of visible jobs in a queue.
    pub async fn queue_length(&self, queue: &str) -> JobResult<u64> {
        self.store.zcard(&self.keys.queue(queue)).await
    }

    /// Number of hidden (delayed or retrying) jobs.
    pub async fn delayed_count(&self) -> JobResult<u64> {
        self.store.zcard(&self.keys.delayed()).await
    }

    /// Number of dispatched jobs still awaiting a completion report.
    pub async fn dispatched_count(&self) -> JobResult<u64> {
        self.store.zcard(&self.keys.dispatched()).await
    }

    /// Number of registered repeating schedules.
    pub async fn schedule_count(&self) -> JobResult<u64> {
        self.store.zcard(&self.keys.schedules()).await
    }

    async fn load(&self, job_id: &JobId) -> JobResult<Option<JobRecord>> {
        match self.store.get(&self.keys.job(job_id)).await? {
            Some(json) => Ok(Some(JobRecord::from_json(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &JobRecord) -> JobResult<()> {
        self.store
            .set(&self.keys.job(&record.id), &record.to_json()?, None)
            .await
    }
}

fn millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}
