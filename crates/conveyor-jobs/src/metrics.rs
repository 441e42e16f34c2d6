//! Metrics for the dispatch core.
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op.

use crate::job::JobClass;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the dispatch core.
pub mod names {
    /// Total jobs added.
    pub const JOBS_ADDED_TOTAL: &str = "conveyor_jobs_added_total";
    /// Total jobs parked by admission control.
    pub const JOBS_PARKED_TOTAL: &str = "conveyor_jobs_parked_total";
    /// Total parked jobs promoted back into an active queue.
    pub const JOBS_PROMOTED_TOTAL: &str = "conveyor_jobs_promoted_total";
    /// Total jobs handed to a worker.
    pub const JOBS_DISPATCHED_TOTAL: &str = "conveyor_jobs_dispatched_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "conveyor_jobs_completed_total";
    /// Total jobs failed permanently.
    pub const JOBS_FAILED_TOTAL: &str = "conveyor_jobs_failed_total";
    /// Total job retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "conveyor_jobs_retried_total";
    /// Total jobs cancelled before dispatch.
    pub const JOBS_REMOVED_TOTAL: &str = "conveyor_jobs_removed_total";
    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "conveyor_job_duration_seconds";

    /// Total payloads dropped as duplicates.
    pub const DEDUP_SUPPRESSED_TOTAL: &str = "conveyor_dedup_suppressed_total";

    /// Total slot acquisitions that found no free capacity.
    pub const CAPACITY_EXHAUSTED_TOTAL: &str = "conveyor_capacity_exhausted_total";
    /// Registered workers.
    pub const WORKERS_REGISTERED: &str = "conveyor_workers_registered";

    /// Total lock acquisitions that timed out.
    pub const LOCK_TIMEOUTS_TOTAL: &str = "conveyor_lock_timeouts_total";

    /// Total persisted records upgraded by the migration sweep.
    pub const RECORDS_MIGRATED_TOTAL: &str = "conveyor_records_migrated_total";

    /// Total dispatch pauses caused by an unreachable backend.
    pub const BACKEND_PAUSES_TOTAL: &str = "conveyor_backend_pauses_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ADDED_TOTAL, "Total number of jobs added");
    describe_counter!(
        names::JOBS_PARKED_TOTAL,
        "Total number of jobs parked by admission control"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total number of parked jobs promoted"
    );
    describe_counter!(
        names::JOBS_DISPATCHED_TOTAL,
        "Total number of jobs handed to a worker"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that failed permanently"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries");
    describe_counter!(
        names::JOBS_REMOVED_TOTAL,
        "Total number of jobs cancelled before dispatch"
    );
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );

    describe_counter!(
        names::DEDUP_SUPPRESSED_TOTAL,
        "Total number of payloads dropped as duplicates"
    );

    describe_counter!(
        names::CAPACITY_EXHAUSTED_TOTAL,
        "Total number of slot acquisitions with no free capacity"
    );
    describe_gauge!(names::WORKERS_REGISTERED, "Number of registered workers");

    describe_counter!(
        names::LOCK_TIMEOUTS_TOTAL,
        "Total number of lock acquisitions that timed out"
    );

    describe_counter!(
        names::RECORDS_MIGRATED_TOTAL,
        "Total number of persisted records upgraded"
    );

    describe_counter!(
        names::BACKEND_PAUSES_TOTAL,
        "Total number of dispatch pauses caused by backend unavailability"
    );
}

/// Job lifecycle metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job added.
    pub fn job_added(class: JobClass, disposition: &'static str) {
        counter!(
            names::JOBS_ADDED_TOTAL,
            "class" => class.as_str(),
            "disposition" => disposition
        )
        .increment(1);
    }

    /// Record a job parked.
    pub fn job_parked(class: JobClass) {
        counter!(names::JOBS_PARKED_TOTAL, "class" => class.as_str()).increment(1);
    }

    /// Record a parked job promoted.
    pub fn job_promoted(class: JobClass) {
        counter!(names::JOBS_PROMOTED_TOTAL, "class" => class.as_str()).increment(1);
    }

    /// Record a job dispatched.
    pub fn job_dispatched(queue: &str) {
        counter!(names::JOBS_DISPATCHED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(class: JobClass, duration: Option<Duration>) {
        counter!(names::JOBS_COMPLETED_TOTAL, "class" => class.as_str()).increment(1);
        if let Some(duration) = duration {
            histogram!(
                names::JOB_DURATION_SECONDS,
                "class" => class.as_str(),
                "status" => "completed"
            )
            .record(duration.as_secs_f64());
        }
    }

    /// Record a job failed permanently.
    pub fn job_failed(class: JobClass) {
        counter!(names::JOBS_FAILED_TOTAL, "class" => class.as_str()).increment(1);
    }

    /// Record a job retry.
    pub fn job_retried(class: JobClass, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "class" => class.as_str(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a job cancelled.
    pub fn job_removed(class: JobClass) {
        counter!(names::JOBS_REMOVED_TOTAL, "class" => class.as_str()).increment(1);
    }
}

/// Dedup metrics recorder.
#[derive(Clone)]
pub struct DedupMetrics;

impl DedupMetrics {
    /// Record suppressed duplicates.
    pub fn suppressed(count: u64) {
        if count > 0 {
            counter!(names::DEDUP_SUPPRESSED_TOTAL).increment(count);
        }
    }
}

/// Worker routing metrics recorder.
#[derive(Clone)]
pub struct RouterMetrics;

impl RouterMetrics {
    /// Record an acquisition that found no capacity.
    pub fn capacity_exhausted(strategy: &'static str) {
        counter!(names::CAPACITY_EXHAUSTED_TOTAL, "strategy" => strategy).increment(1);
    }

    /// Update registered worker count.
    pub fn update_workers(strategy: &'static str, registered: usize) {
        gauge!(names::WORKERS_REGISTERED, "strategy" => strategy).set(registered as f64);
    }
}

/// Lock metrics recorder.
#[derive(Clone)]
pub struct LockMetrics;

impl LockMetrics {
    /// Record a lock timeout.
    pub fn timeout(key: &str) {
        counter!(names::LOCK_TIMEOUTS_TOTAL, "lock" => key.to_string()).increment(1);
    }
}

/// Maintenance metrics recorder.
#[derive(Clone)]
pub struct MaintenanceMetrics;

impl MaintenanceMetrics {
    /// Record records upgraded by the migration sweep.
    pub fn records_migrated(count: u64) {
        counter!(names::RECORDS_MIGRATED_TOTAL).increment(count);
    }

    /// Record a dispatch pause.
    pub fn backend_paused() {
        counter!(names::BACKEND_PAUSES_TOTAL).increment(1);
    }
}
