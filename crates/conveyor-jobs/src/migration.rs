//! Schema migration sweep.
//!
//! Persisted job records carry a `schema_version` tag (absent on the oldest
//! layout). Each historical layout is a variant of [`VersionedJobRecord`] and
//! each transition is a pure function, so the sweep itself only decides what
//! to read, what to write back and where to re-index.
//!
//! The sweep runs once per deployment: it holds the `migration` lock, and a
//! schema marker in the store lets later startups skip the scan.

use crate::error::{JobError, JobResult};
use crate::job::{JobClass, JobId, JobRecord, JobState, Priority, CURRENT_SCHEMA_VERSION};
use crate::keys::StoreKeys;
use crate::lock::{DistributedLock, MIGRATION_LOCK};
use crate::metrics::MaintenanceMetrics;
use crate::queue::QueueManager;
use crate::schedule::CronSchedule;
use crate::store::CoordinationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DRAIN_BATCH: usize = 100;

/// Oldest record layout: camelCase, string enums, no version tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecordV0 {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub project_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub delay_until: Option<i64>,
    #[serde(default)]
    pub attempts_made: u32,
    /// Epoch milliseconds.
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Second layout: snake_case, numeric priority, flat cron fields, no state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecordV1 {
    pub schema_version: u32,
    pub id: JobId,
    pub class: JobClass,
    pub tenant_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i8,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub cron_timezone: Option<String>,
    #[serde(default)]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// A persisted job record in any known layout.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedJobRecord {
    V0(JobRecordV0),
    V1(JobRecordV1),
    V2(JobRecord),
}

impl VersionedJobRecord {
    /// Parses a stored record, dispatching on its version tag.
    pub fn parse(json: &str) -> JobResult<Self> {
        let value: Value = serde_json::from_str(json)?;
        let version = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        match version {
            0 => Ok(Self::V0(serde_json::from_value(value)?)),
            1 => Ok(Self::V1(serde_json::from_value(value)?)),
            2 => Ok(Self::V2(serde_json::from_value(value)?)),
            other => Err(JobError::Migration(format!(
                "unknown schema version {}",
                other
            ))),
        }
    }

    /// Version tag of the stored layout.
    pub fn version(&self) -> u32 {
        match self {
            Self::V0(_) => 0,
            Self::V1(_) => 1,
            Self::V2(_) => 2,
        }
    }

    /// True if the record is already in the current layout.
    pub fn is_current(&self) -> bool {
        self.version() == CURRENT_SCHEMA_VERSION
    }

    /// Upgrades through every transition to the current layout.
    pub fn upgrade(self, now: DateTime<Utc>, default_max_attempts: u32) -> JobResult<JobRecord> {
        match self {
            Self::V0(v0) => upgrade_v1(upgrade_v0(v0, default_max_attempts)?, now),
            Self::V1(v1) => upgrade_v1(v1, now),
            Self::V2(record) => Ok(record),
        }
    }
}

/// V0 → V1: renames fields, parses the class, maps priority names to weights.
pub fn upgrade_v0(v0: JobRecordV0, default_max_attempts: u32) -> JobResult<JobRecordV1> {
    let class: JobClass = v0
        .job_type
        .parse()
        .map_err(|e: String| JobError::Migration(format!("job {}: {}", v0.id, e)))?;

    let priority = match v0.priority.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("high") | Some("critical") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Medium,
    };

    let millis = |ms: i64| {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| JobError::Migration(format!("job {}: timestamp {} out of range", v0.id, ms)))
    };
    let delay_until = v0.delay_until.map(millis).transpose()?;
    let created_at = match v0.created_at {
        Some(ms) => millis(ms)?,
        None => DateTime::<Utc>::default(),
    };

    Ok(JobRecordV1 {
        schema_version: 1,
        id: JobId::from(v0.id),
        class,
        tenant_id: v0.project_id,
        payload: v0.data,
        priority: priority.weight(),
        cron_expression: v0.cron,
        cron_timezone: v0.timezone,
        delay_until,
        attempt: v0.attempts_made,
        max_attempts: Some(default_max_attempts),
        created_at,
    })
}

/// V1 → V2: nests the cron fields into a validated schedule and derives state.
///
/// Repeating records become schedule entries due at their next fire time.
/// Anything else is delayed until `delay_until` or queued now.
pub fn upgrade_v1(v1: JobRecordV1, now: DateTime<Utc>) -> JobResult<JobRecord> {
    let mut schedule = None;
    let (state, visible_at) = match (v1.class, v1.cron_expression) {
        (JobClass::Repeating, Some(expression)) => {
            let timezone = v1.cron_timezone.unwrap_or_else(|| "UTC".to_string());
            let cron = CronSchedule::new(expression, timezone)?;
            let next = cron
                .next_after(now)?
                .ok_or_else(|| JobError::Migration(format!("job {}: schedule never fires", v1.id)))?;
            schedule = Some(cron);
            (JobState::Scheduled, next)
        }
        (JobClass::Repeating, None) => {
            return Err(JobError::Migration(format!(
                "job {}: repeating job without cron expression",
                v1.id
            )));
        }
        _ => match v1.delay_until {
            Some(until) if until > now => (JobState::Delayed, until),
            _ => (JobState::Queued, now),
        },
    };

    let max_attempts = v1.max_attempts.unwrap_or(1).max(v1.attempt.saturating_add(1));

    Ok(JobRecord {
        schema_version: CURRENT_SCHEMA_VERSION,
        id: v1.id,
        class: v1.class,
        tenant_id: v1.tenant_id,
        payload: v1.payload,
        priority: Priority::from(v1.priority),
        schedule,
        schedule_id: None,
        delay_until: v1.delay_until,
        attempt: v1.attempt,
        max_attempts,
        state,
        created_at: v1.created_at,
        visible_at,
        worker_id: None,
        dispatched_at: None,
        last_error: None,
    })
}

/// Result of a migration sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Job records read.
    pub scanned: u64,
    /// Records rewritten in the current layout.
    pub upgraded: u64,
    /// Legacy queue entries moved to the current queues.
    pub requeued: u64,
    /// Records left untouched because they could not be upgraded.
    pub skipped: u64,
}

/// One-time, lock-guarded upgrade of persisted job records.
pub struct MigrationSweep {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    lock: Arc<dyn DistributedLock>,
    queue: Arc<QueueManager>,
    lock_timeout: Duration,
    default_max_attempts: u32,
}

impl MigrationSweep {
    /// Creates a sweep.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: StoreKeys,
        lock: Arc<dyn DistributedLock>,
        queue: Arc<QueueManager>,
        lock_timeout: Duration,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            keys,
            lock,
            queue,
            lock_timeout,
            default_max_attempts,
        }
    }

    /// Schema version recorded in the store, if any.
    pub async fn recorded_version(&self) -> JobResult<Option<u32>> {
        match self.store.get(&self.keys.schema_version()).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| JobError::Migration(format!("invalid schema marker: {}", raw))),
            None => Ok(None),
        }
    }

    /// Runs the sweep, returning an empty report when the store is already current.
    ///
    /// The lock lease is renewed while the sweep runs, and a failure to
    /// release it afterwards is logged rather than replacing the sweep result.
    pub async fn run(&self) -> JobResult<MigrationReport> {
        let mut guard = self.lock.acquire(MIGRATION_LOCK, self.lock_timeout).await?;
        let result = guard.renew_while(self.lock_timeout, self.run_locked()).await;
        if let Err(e) = guard.release().await {
            warn!(lock = MIGRATION_LOCK, error = %e, "Failed to release migration lock, lease will expire");
        }
        result
    }

    async fn run_locked(&self) -> JobResult<MigrationReport> {
        if let Some(version) = self.recorded_version().await? {
            if version >= CURRENT_SCHEMA_VERSION {
                debug!(version, "Schema already current, skipping migration");
                return Ok(MigrationReport::default());
            }
        }

        let now = Utc::now();
        let mut report = MigrationReport::default();

        for key in self.store.scan_prefix(&self.keys.job_prefix()).await? {
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            report.scanned += 1;

            match self.upgrade_one(&key, &json, now).await {
                Ok(true) => report.upgraded += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping record that cannot be upgraded");
                    report.skipped += 1;
                }
            }
        }

        report.requeued = self.drain_legacy_queue(now).await?;

        self.store
            .set(
                &self.keys.schema_version(),
                &CURRENT_SCHEMA_VERSION.to_string(),
                None,
            )
            .await?;

        MaintenanceMetrics::records_migrated(report.upgraded);
        info!(
            scanned = report.scanned,
            upgraded = report.upgraded,
            requeued = report.requeued,
            skipped = report.skipped,
            version = CURRENT_SCHEMA_VERSION,
            "Migration sweep complete"
        );
        Ok(report)
    }

    async fn upgrade_one(&self, key: &str, json: &str, now: DateTime<Utc>) -> JobResult<bool> {
        let versioned = VersionedJobRecord::parse(json)?;
        if versioned.is_current() {
            return Ok(false);
        }

        let from = versioned.version();
        let record = versioned.upgrade(now, self.default_max_attempts)?;
        self.store.set(key, &record.to_json()?, None).await?;

        if record.state == JobState::Scheduled
            && self
                .store
                .zscore(&self.keys.schedules(), record.id.as_str())
                .await?
                .is_none()
        {
            self.store
                .zadd(
                    &self.keys.schedules(),
                    record.id.as_str(),
                    record.visible_at.timestamp_millis() as f64,
                )
                .await?;
        }

        debug!(job_id = %record.id, from, to = CURRENT_SCHEMA_VERSION, "Upgraded job record");
        Ok(true)
    }

    /// Moves every job from the legacy single pending set into the current queues.
    async fn drain_legacy_queue(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let legacy = self.keys.legacy_pending();
        let mut requeued = 0;

        loop {
            let batch = self
                .store
                .zrange_by_score(&legacy, f64::NEG_INFINITY, f64::INFINITY, DRAIN_BATCH)
                .await?;
            if batch.is_empty() {
                break;
            }

            for (id, _) in batch {
                if !self.store.zrem(&legacy, &id).await? {
                    continue;
                }
                let job_id = JobId::from(id);
                let Some(record) = self.queue.get(&job_id).await? else {
                    warn!(job_id = %job_id, "Legacy queue entry has no record, dropping");
                    continue;
                };

                match record.state {
                    JobState::Scheduled => continue,
                    JobState::Delayed if record.visible_at > now => {
                        self.store
                            .zadd(
                                &self.keys.delayed(),
                                record.id.as_str(),
                                record.visible_at.timestamp_millis() as f64,
                            )
                            .await?;
                    }
                    _ => {
                        self.queue.admit(record).await?;
                    }
                }
                requeued += 1;
            }
        }

        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::AdmissionConfig;
    use crate::lock::LocalLock;
    use crate::retry::RetryPolicy;
    use crate::router::SimpleRouter;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    struct Fixture {
        store: Arc<dyn CoordinationStore>,
        keys: StoreKeys,
        queue: Arc<QueueManager>,
        sweep: MigrationSweep,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let keys = StoreKeys::new("t");
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            keys.clone(),
            AdmissionConfig::default(),
        ));
        let queue = Arc::new(QueueManager::new(
            store.clone(),
            keys.clone(),
            admission,
            Arc::new(SimpleRouter::new()),
            RetryPolicy::default(),
            100,
        ));
        let sweep = MigrationSweep::new(
            store.clone(),
            keys.clone(),
            Arc::new(LocalLock::new()),
            queue.clone(),
            Duration::from_secs(5),
            5,
        );
        Fixture {
            store,
            keys,
            queue,
            sweep,
        }
    }

    fn v0_json(id: &str) -> String {
        json!({
            "id": id,
            "type": "ONE_TIME",
            "projectId": "acme",
            "data": {"flow": "f1"},
            "priority": "high",
            "attemptsMade": 1,
            "createdAt": 1_700_000_000_000i64
        })
        .to_string()
    }

    #[test]
    fn test_missing_version_is_v0() {
        let record = VersionedJobRecord::parse(&v0_json("a")).unwrap();
        assert_eq!(record.version(), 0);
        assert!(!record.is_current());
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let result = VersionedJobRecord::parse(r#"{"schema_version": 9}"#);
        assert!(matches!(result, Err(JobError::Migration(_))));
    }

    #[test]
    fn test_upgrade_v0_maps_fields() {
        let VersionedJobRecord::V0(v0) = VersionedJobRecord::parse(&v0_json("a")).unwrap() else {
            panic!("expected v0");
        };
        let v1 = upgrade_v0(v0, 5).unwrap();
        assert_eq!(v1.class, JobClass::OneTime);
        assert_eq!(v1.tenant_id, "acme");
        assert_eq!(v1.priority, 10);
        assert_eq!(v1.attempt, 1);
        assert_eq!(v1.payload, json!({"flow": "f1"}));
    }

    #[test]
    fn test_upgrade_v0_rejects_unknown_type() {
        let json = json!({"id": "a", "type": "BATCH", "projectId": "acme"}).to_string();
        let VersionedJobRecord::V0(v0) = VersionedJobRecord::parse(&json).unwrap() else {
            panic!("expected v0");
        };
        assert!(matches!(upgrade_v0(v0, 5), Err(JobError::Migration(_))));
    }

    #[test]
    fn test_upgrade_v1_repeating_becomes_schedule() {
        let now = Utc::now();
        let v1 = JobRecordV1 {
            schema_version: 1,
            id: JobId::from("sync"),
            class: JobClass::Repeating,
            tenant_id: "acme".into(),
            payload: json!({}),
            priority: 0,
            cron_expression: Some("*/5 * * * *".into()),
            cron_timezone: None,
            delay_until: None,
            attempt: 0,
            max_attempts: Some(3),
            created_at: now,
        };

        let record = upgrade_v1(v1, now).unwrap();
        assert_eq!(record.state, JobState::Scheduled);
        assert_eq!(record.schedule.unwrap().expression, "*/5 * * * *");
        assert!(record.visible_at > now);
        assert_eq!(record.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_v1_future_delay_stays_delayed() {
        let now = Utc::now();
        let until = now + ChronoDuration::minutes(5);
        let v1 = JobRecordV1 {
            schema_version: 1,
            id: JobId::from("d"),
            class: JobClass::Delayed,
            tenant_id: "acme".into(),
            payload: json!({}),
            priority: -10,
            cron_expression: None,
            cron_timezone: None,
            delay_until: Some(until),
            attempt: 0,
            max_attempts: None,
            created_at: now,
        };

        let record = upgrade_v1(v1, now).unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert_eq!(record.visible_at, until);
        assert_eq!(record.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_sweep_upgrades_and_drains_legacy_queue() {
        let f = fixture();
        f.store
            .set(&f.keys.job(&JobId::from("a")), &v0_json("a"), None)
            .await
            .unwrap();
        f.store.zadd(&f.keys.legacy_pending(), "a", 1.0).await.unwrap();

        let report = f.sweep.run().await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                scanned: 1,
                upgraded: 1,
                requeued: 1,
                skipped: 0
            }
        );

        let record = f.queue.get(&JobId::from("a")).await.unwrap().unwrap();
        assert_eq!(record.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(f.queue.queue_length("one_time").await.unwrap(), 1);
        assert_eq!(f.store.zcard(&f.keys.legacy_pending()).await.unwrap(), 0);
        assert_eq!(
            f.sweep.recorded_version().await.unwrap(),
            Some(CURRENT_SCHEMA_VERSION)
        );
    }

    #[tokio::test]
    async fn test_second_run_is_skipped() {
        let f = fixture();
        f.store
            .set(&f.keys.job(&JobId::from("a")), &v0_json("a"), None)
            .await
            .unwrap();
        f.sweep.run().await.unwrap();

        f.store
            .set(&f.keys.job(&JobId::from("b")), &v0_json("b"), None)
            .await
            .unwrap();
        let report = f.sweep.run().await.unwrap();
        assert_eq!(report, MigrationReport::default());
    }

    #[tokio::test]
    async fn test_bad_record_is_skipped() {
        let f = fixture();
        f.store
            .set(&f.keys.job(&JobId::from("bad")), "{not json", None)
            .await
            .unwrap();
        f.store
            .set(&f.keys.job(&JobId::from("a")), &v0_json("a"), None)
            .await
            .unwrap();

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.upgraded, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_current_records_are_untouched() {
        let f = fixture();
        f.queue
            .add(crate::job::JobSpec::one_time("acme", json!({})).id("cur"))
            .await
            .unwrap();

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.upgraded, 0);
        assert_eq!(f.queue.queue_length("one_time").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_under_lease_lock() {
        let f = fixture();
        f.store
            .set(&f.keys.job(&JobId::from("a")), &v0_json("a"), None)
            .await
            .unwrap();
        let lock = crate::lock::LeaseLock::new(
            vec![f.store.clone()],
            f.keys.clone(),
            crate::config::LockConfig::default(),
        )
        .unwrap();
        let sweep = MigrationSweep::new(
            f.store.clone(),
            f.keys.clone(),
            Arc::new(lock),
            f.queue.clone(),
            Duration::from_secs(5),
            5,
        );

        let report = sweep.run().await.unwrap();
        assert_eq!(report.upgraded, 1);
        assert!(f.store.get(&f.keys.lock(MIGRATION_LOCK)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_releases_lock() {
        let f = fixture();
        f.sweep.run().await.unwrap();
        let guard = f
            .sweep
            .lock
            .acquire(MIGRATION_LOCK, Duration::from_millis(50))
            .await
            .unwrap();
        guard.release().await.unwrap();
    }
}
