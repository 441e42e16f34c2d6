//! Job definitions and the persisted job record.

use crate::error::{JobError, JobResult};
use crate::schedule::CronSchedule;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the instance a repeating schedule fires at `fire_at`.
    ///
    /// Deterministic so that two processes firing the same slot collide.
    pub fn fired_instance(&self, fire_at: DateTime<Utc>) -> Self {
        Self(format!("{}@{}", self.0, fire_at.timestamp_millis()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Category of work unit; determines scheduling semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    /// Run once, as soon as admitted.
    OneTime,
    /// Cron-driven; the id names the schedule.
    Repeating,
    /// Run once, not before `delay_until`.
    Delayed,
    /// Externally triggered delivery.
    Webhook,
}

impl JobClass {
    /// All classes, in declaration order.
    pub const ALL: [JobClass; 4] = [
        JobClass::OneTime,
        JobClass::Repeating,
        JobClass::Delayed,
        JobClass::Webhook,
    ];

    /// Stable name used in keys, metrics and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::OneTime => "one_time",
            JobClass::Repeating => "repeating",
            JobClass::Delayed => "delayed",
            JobClass::Webhook => "webhook",
        }
    }

    /// Name of the active queue jobs of this class are dispatched from.
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobClass::OneTime => "one_time",
            JobClass::Repeating | JobClass::Delayed => "scheduled",
            JobClass::Webhook => "webhooks",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "one_time" | "onetime" => Ok(JobClass::OneTime),
            "repeating" => Ok(JobClass::Repeating),
            "delayed" => Ok(JobClass::Delayed),
            "webhook" => Ok(JobClass::Webhook),
            other => Err(format!("unknown job class: {}", other)),
        }
    }
}

/// Job priority tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default tier.
    #[default]
    Medium,
    /// Served before every medium and low job in the same queue.
    High,
}

impl Priority {
    /// Weight used to build queue scores; higher is served first.
    pub fn weight(&self) -> i8 {
        match self {
            Priority::Low => -10,
            Priority::Medium => 0,
            Priority::High => 10,
        }
    }

    /// Sorted-set score: higher priority sorts first, then earlier visibility.
    pub fn score(&self, visible_at: DateTime<Utc>) -> f64 {
        -(self.weight() as f64) * 10_000_000_000_000.0 + visible_at.timestamp_millis() as f64
    }
}

impl From<i8> for Priority {
    fn from(value: i8) -> Self {
        match value {
            v if v >= 10 => Priority::High,
            v if v <= -10 => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Where a job currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// A repeating schedule entry waiting for its next fire time.
    Scheduled,
    /// Waiting for its visibility time.
    Delayed,
    /// In an active queue, visible to dispatchers.
    Queued,
    /// Held back by admission control.
    Parked,
    /// Handed to a worker; owned by it until completion is reported.
    Dispatched,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Delayed => write!(f, "delayed"),
            JobState::Queued => write!(f, "queued"),
            JobState::Parked => write!(f, "parked"),
            JobState::Dispatched => write!(f, "dispatched"),
        }
    }
}

/// Persisted job record (current schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Schema version tag.
    pub schema_version: u32,

    /// Job ID.
    pub id: JobId,

    /// Job class.
    pub class: JobClass,

    /// Owning tenant (project).
    pub tenant_id: String,

    /// Opaque payload handed to the executor.
    pub payload: Value,

    /// Priority tier.
    pub priority: Priority,

    /// Cron schedule (repeating schedule entries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CronSchedule>,

    /// Schedule that fired this job (repeating instances only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<JobId>,

    /// Earliest visibility (delayed jobs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,

    /// Dispatch attempts made so far.
    pub attempt: u32,

    /// Maximum attempts before the job is dropped.
    pub max_attempts: u32,

    /// Current state.
    pub state: JobState,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job becomes (or became) visible to dispatchers.
    pub visible_at: DateTime<Utc>,

    /// Worker the job was dispatched to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// When the current attempt was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,

    /// Error from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Name of the active queue this record is dispatched from.
    pub fn queue_name(&self) -> &'static str {
        self.class.queue_name()
    }

    /// True once every allowed attempt has been used.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds the instance a repeating schedule fires at `fire_at`.
    pub fn fire_instance(&self, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            id: self.id.fired_instance(fire_at),
            class: JobClass::Repeating,
            tenant_id: self.tenant_id.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            schedule: None,
            schedule_id: Some(self.id.clone()),
            delay_until: None,
            attempt: 0,
            max_attempts: self.max_attempts,
            state: JobState::Queued,
            created_at: now,
            visible_at: now,
            worker_id: None,
            dispatched_at: None,
            last_error: None,
        }
    }
}

/// How an added job was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Visible in its active queue.
    Queued,
    /// Waiting for its visibility time.
    Delayed,
    /// Held back by admission control.
    Parked,
    /// New repeating schedule registered.
    Scheduled,
    /// Existing repeating schedule updated in place.
    Rescheduled,
}

impl Disposition {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Queued => "queued",
            Disposition::Delayed => "delayed",
            Disposition::Parked => "parked",
            Disposition::Scheduled => "scheduled",
            Disposition::Rescheduled => "rescheduled",
        }
    }
}

/// Result of adding a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// Id of the job (or schedule).
    pub job_id: JobId,
    /// Where the job went.
    pub disposition: Disposition,
}

/// Typed request to add a job.
///
/// # Example
///
/// ```rust,ignore
/// let spec = JobSpec::one_time("acme", json!({"flow_version_id": "fv-1"}))
///     .priority(Priority::High)
///     .delay(Duration::from_secs(30));
/// manager.add(spec).await?;
/// ```
#[derive(Debug, Clone)]
pub struct JobSpec {
    id: Option<JobId>,
    class: JobClass,
    tenant_id: String,
    payload: Value,
    priority: Priority,
    cron: Option<(String, String)>,
    delay: Option<Duration>,
    delay_until: Option<DateTime<Utc>>,
    max_attempts: Option<u32>,
}

impl JobSpec {
    fn new(class: JobClass, tenant_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            class,
            tenant_id: tenant_id.into(),
            payload,
            priority: Priority::Medium,
            cron: None,
            delay: None,
            delay_until: None,
            max_attempts: None,
        }
    }

    /// A job that runs once, as soon as it is admitted.
    pub fn one_time(tenant_id: impl Into<String>, payload: Value) -> Self {
        Self::new(JobClass::OneTime, tenant_id, payload)
    }

    /// An externally triggered delivery.
    pub fn webhook(tenant_id: impl Into<String>, payload: Value) -> Self {
        Self::new(JobClass::Webhook, tenant_id, payload)
    }

    /// A job that becomes visible at `delay_until`.
    pub fn delayed(tenant_id: impl Into<String>, payload: Value, delay_until: DateTime<Utc>) -> Self {
        let mut spec = Self::new(JobClass::Delayed, tenant_id, payload);
        spec.delay_until = Some(delay_until);
        spec
    }

    /// A cron-driven schedule identified by `id`.
    ///
    /// Re-adding the same id replaces the schedule instead of creating a second one.
    pub fn repeating(
        id: impl Into<JobId>,
        tenant_id: impl Into<String>,
        payload: Value,
        cron_expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        let mut spec = Self::new(JobClass::Repeating, tenant_id, payload);
        spec.id = Some(id.into());
        spec.cron = Some((cron_expression.into(), timezone.into()));
        spec
    }

    /// Set an explicit id.
    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Hide the job from consumers until the delay elapses.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Override the maximum number of attempts.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Job class.
    pub fn class(&self) -> JobClass {
        self.class
    }

    /// Owning tenant.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Build the record to persist.
    ///
    /// Fails with `InvalidSchedule` for a malformed cron expression or
    /// timezone, or a delay too large to represent as a point in time.
    pub fn into_record(self, now: DateTime<Utc>, default_max_attempts: u32) -> JobResult<JobRecord> {
        let id = self.id.unwrap_or_default();
        if id.as_str().is_empty() {
            return Err(JobError::Configuration("job id must not be empty".into()));
        }

        let mut schedule = None;
        let (state, visible_at) = match self.class {
            JobClass::Repeating => {
                let (expression, timezone) = self
                    .cron
                    .ok_or_else(|| JobError::InvalidSchedule("missing cron expression".into()))?;
                let cron = CronSchedule::new(expression, timezone)?;
                let next = cron.next_after(now)?.ok_or_else(|| {
                    JobError::InvalidSchedule(format!("{} never fires", cron.expression))
                })?;
                schedule = Some(cron);
                (JobState::Scheduled, next)
            }
            JobClass::Delayed => {
                let until = self.delay_until.unwrap_or(now);
                visibility(until, now)
            }
            JobClass::OneTime | JobClass::Webhook => match self.delay {
                Some(delay) => {
                    let until = ChronoDuration::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .ok_or_else(|| {
                            JobError::InvalidSchedule(format!("delay of {:?} is out of range", delay))
                        })?;
                    visibility(until, now)
                }
                None => (JobState::Queued, now),
            },
        };

        Ok(JobRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            id,
            class: self.class,
            tenant_id: self.tenant_id,
            payload: self.payload,
            priority: self.priority,
            schedule,
            schedule_id: None,
            delay_until: self.delay_until,
            attempt: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            state,
            created_at: now,
            visible_at,
            worker_id: None,
            dispatched_at: None,
            last_error: None,
        })
    }
}

fn visibility(until: DateTime<Utc>, now: DateTime<Utc>) -> (JobState, DateTime<Utc>) {
    if until > now {
        (JobState::Delayed, until)
    } else {
        (JobState::Queued, now)
    }
}
