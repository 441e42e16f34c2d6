//! Shared harness for dispatch integration tests.
//!
//! Everything runs against the in-memory backend, which implements the same
//! atomic operations as the Redis store.

#![allow(dead_code)]

use async_trait::async_trait;
use conveyor_jobs::{DispatchCore, JobExecutor, JobOutcome, JobRecord, JobsConfig, RoutingStrategy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builds an in-memory core with the given per-tenant ceiling.
pub fn core_with_ceiling(ceiling: u32) -> DispatchCore {
    let mut config = test_config();
    config.admission.max_concurrent_per_tenant = ceiling;
    DispatchCore::in_memory(&config)
}

/// Configuration tuned for fast tests.
pub fn test_config() -> JobsConfig {
    let mut config = JobsConfig::default();
    config.redis.key_prefix = "it".to_string();
    config.router.strategy = RoutingStrategy::Capacity;
    config.router.acquire_timeout_ms = 20;
    config.dispatcher.poll_interval_ms = 5;
    config.dispatcher.job_timeout_secs = 5;
    config.dispatcher.shutdown_timeout_secs = 2;
    config
}

/// Executor that records every job it sees and reports a fixed outcome.
pub struct RecordingExecutor {
    outcome: JobOutcome,
    delay: Duration,
    seen: Mutex<Vec<JobRecord>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl RecordingExecutor {
    pub fn succeeding() -> Arc<Self> {
        Self::with(JobOutcome::Succeeded, Duration::ZERO)
    }

    pub fn with(outcome: JobOutcome, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            delay,
            seen: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    pub fn seen(&self) -> Vec<JobRecord> {
        self.seen.lock().clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Highest number of executions observed at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, job: &JobRecord, _worker_id: &str) -> JobOutcome {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        self.seen.lock().push(job.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Polls `condition` every few milliseconds until it holds or `within` passes.
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
