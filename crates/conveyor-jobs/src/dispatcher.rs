//! Dispatch loop: pumps due work, reserves a worker slot, hands the next job
//! to the executor and reports its completion.

use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::job::JobRecord;
use crate::metrics::MaintenanceMetrics;
use crate::queue::{JobFinished, JobOutcome, QueueManager};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Dispatch loop settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Queues to poll, in order.
    pub queues: Vec<String>,

    /// Sleep between idle polls.
    pub poll_interval: Duration,

    /// How long to wait for a free worker slot per tick.
    pub acquire_timeout: Duration,

    /// Execution timeout per job.
    pub job_timeout: Duration,

    /// Grace period for running jobs at shutdown.
    pub shutdown_timeout: Duration,

    /// Upper bound of the pause while the backend is unavailable.
    pub max_backend_backoff: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&JobsConfig::default())
    }
}

impl From<&JobsConfig> for DispatcherSettings {
    fn from(config: &JobsConfig) -> Self {
        Self {
            queues: config.dispatcher.queues.clone(),
            poll_interval: config.dispatcher.poll_interval(),
            acquire_timeout: config.router.acquire_timeout(),
            job_timeout: config.dispatcher.job_timeout(),
            shutdown_timeout: config.dispatcher.shutdown_timeout(),
            max_backend_backoff: config.dispatcher.max_backend_backoff(),
        }
    }
}

/// Runs a dispatched job. The boundary to whatever actually executes payloads.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Executes `job` on `worker_id` and reports how it ended.
    async fn execute(&self, job: &JobRecord, worker_id: &str) -> JobOutcome;
}

/// Dispatches jobs from the queue manager to an executor.
pub struct Dispatcher {
    id: String,
    queue: Arc<QueueManager>,
    executor: Arc<dyn JobExecutor>,
    settings: DispatcherSettings,
    shutdown_tx: watch::Sender<bool>,
    abandon_tx: watch::Sender<bool>,
    last_pump: Mutex<Option<Instant>>,
    running: AtomicBool,
    jobs_dispatched: Arc<AtomicU64>,
    jobs_failed: Arc<AtomicU64>,
}

/// Result of one dispatch tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A job was handed to the executor.
    Dispatched,
    /// No free worker slot.
    NoCapacity,
    /// A slot was free but no job was visible.
    Idle,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        queue: Arc<QueueManager>,
        executor: Arc<dyn JobExecutor>,
        settings: DispatcherSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (abandon_tx, _) = watch::channel(false);

        Self {
            id: format!("dispatcher-{}", Uuid::new_v4()),
            queue,
            executor,
            settings,
            shutdown_tx,
            abandon_tx,
            last_pump: Mutex::new(None),
            running: AtomicBool::new(false),
            jobs_dispatched: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs the loop until [`stop`](Self::stop) is called, then waits up to the
    /// shutdown timeout for running jobs.
    ///
    /// Jobs still running after the timeout are given up and handed back to
    /// the queue without using an attempt. A stop requested before `run`
    /// makes it return without dispatching.
    pub async fn run(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("dispatcher already running".into()));
        }

        info!(
            dispatcher_id = %self.id,
            queues = ?self.settings.queues,
            "Starting dispatcher"
        );

        self.abandon_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();
        let mut backend_backoff = self.backend_backoff();

        loop {
            if *shutdown_rx.borrow_and_update() {
                info!(dispatcher_id = %self.id, "Received shutdown signal");
                break;
            }
            while tasks.try_join_next().is_some() {}

            let pause = match self.tick(&mut tasks).await {
                Ok(Tick::Dispatched) => {
                    backend_backoff.reset();
                    Duration::ZERO
                }
                Ok(Tick::NoCapacity | Tick::Idle) => {
                    backend_backoff.reset();
                    self.settings.poll_interval
                }
                Err(e) if e.is_backend_unavailable() => {
                    let pause = backend_backoff
                        .next_backoff()
                        .unwrap_or(self.settings.max_backend_backoff);
                    MaintenanceMetrics::backend_paused();
                    warn!(
                        dispatcher_id = %self.id,
                        error = %e,
                        pause_ms = pause.as_millis() as u64,
                        "Backend unavailable, pausing dispatch"
                    );
                    pause
                }
                Err(e) => {
                    error!(dispatcher_id = %self.id, error = %e, "Dispatch tick failed");
                    self.settings.poll_interval
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(dispatcher_id = %self.id, running = tasks.len(), "Waiting for running jobs...");
        if !drain(&mut tasks, self.settings.shutdown_timeout).await {
            warn!(
                dispatcher_id = %self.id,
                abandoned = tasks.len(),
                "Shutdown timeout, handing running jobs back to the queue"
            );
            self.abandon_tx.send_replace(true);
            if !drain(&mut tasks, self.settings.shutdown_timeout).await {
                // Dispatches left behind here are recovered by the pump.
                error!(dispatcher_id = %self.id, left = tasks.len(), "Abandoned jobs did not report back, aborting");
                tasks.abort_all();
            }
        }

        self.shutdown_tx.send_replace(false);
        self.running.store(false, Ordering::SeqCst);
        info!(
            dispatcher_id = %self.id,
            dispatched = self.jobs_dispatched(),
            failed = self.jobs_failed(),
            "Dispatcher stopped"
        );
        Ok(())
    }

    /// One pass: pump (at most once per poll interval), reserve a slot,
    /// dequeue, spawn the execution.
    pub async fn tick(&self, tasks: &mut JoinSet<()>) -> JobResult<Tick> {
        if self.pump_due() {
            self.queue.pump(Utc::now()).await?;
        }

        let router = self.queue.router();
        let worker_id = match router.acquire_within(self.settings.acquire_timeout).await {
            Ok(worker_id) => worker_id,
            Err(JobError::NoCapacityAvailable) => return Ok(Tick::NoCapacity),
            Err(e) => return Err(e),
        };

        let job = match self.queue.dequeue(&self.settings.queues, &worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                router.release(&worker_id).await?;
                return Ok(Tick::Idle);
            }
            Err(e) => {
                if let Err(release_err) = router.release(&worker_id).await {
                    warn!(worker_id = %worker_id, error = %release_err, "Failed to release slot");
                }
                return Err(e);
            }
        };

        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        let queue = self.queue.clone();
        let executor = self.executor.clone();
        let job_timeout = self.settings.job_timeout;
        let jobs_failed = self.jobs_failed.clone();
        let mut abandon_rx = self.abandon_tx.subscribe();
        let span = tracing::info_span!("job", job_id = %job.id, worker_id = %worker_id);

        tasks.spawn(
            async move {
                let outcome = tokio::select! {
                    result = timeout(job_timeout, executor.execute(&job, &worker_id)) => match result {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(timeout_secs = job_timeout.as_secs(), "Job timed out");
                            JobOutcome::Failed {
                                error: format!("timed out after {}s", job_timeout.as_secs()),
                                retryable: true,
                            }
                        }
                    },
                    _ = async {
                        if abandon_rx.wait_for(|abandon| *abandon).await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    } => {
                        warn!("Job abandoned at shutdown");
                        JobOutcome::Abandoned
                    }
                };
                if matches!(outcome, JobOutcome::Failed { .. }) {
                    jobs_failed.fetch_add(1, Ordering::Relaxed);
                }
                debug!(outcome = ?outcome, "Job finished");

                let finished = JobFinished {
                    job_id: job.id.clone(),
                    worker_id,
                    outcome,
                };
                if let Err(e) = queue.finish(finished).await {
                    error!(error = %e, "Failed to record job completion");
                }
            }
            .instrument(span),
        );

        Ok(Tick::Dispatched)
    }

    /// Signals the loop to stop. Takes effect even before [`run`](Self::run) starts.
    pub fn stop(&self) {
        info!(dispatcher_id = %self.id, "Stopping dispatcher...");
        self.shutdown_tx.send_replace(true);
    }

    /// Check if the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Jobs handed to the executor.
    pub fn jobs_dispatched(&self) -> u64 {
        self.jobs_dispatched.load(Ordering::Relaxed)
    }

    /// Jobs whose attempt failed.
    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Dispatcher ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn pump_due(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_pump.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.settings.poll_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn backend_backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.settings.poll_interval.max(Duration::from_millis(10)))
            .with_max_interval(self.settings.max_backend_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Waits for every task up to `limit`. True when the set emptied in time.
async fn drain(tasks: &mut JoinSet<()>, limit: Duration) -> bool {
    timeout(limit, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_ok()
}
