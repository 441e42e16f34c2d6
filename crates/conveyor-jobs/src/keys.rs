//! Coordination store key schema.

use crate::job::{JobClass, JobId};

/// Builds every key the dispatch core touches from one prefix.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Job record (JSON string).
    pub fn job(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Prefix shared by every job record, for scans.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Active queue (sorted set scored by priority, then visibility).
    pub fn queue(&self, queue_name: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue_name)
    }

    /// Delayed jobs (sorted set scored by visibility time in ms).
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// Parked jobs of one tenant and class (sorted set scored by park sequence).
    pub fn parked(&self, tenant_id: &str, class: JobClass) -> String {
        format!("{}:parked:{}:{}", self.prefix, class.as_str(), tenant_id)
    }

    /// Index of non-empty parked sets (sorted set of `class:tenant` members).
    pub fn parked_index(&self) -> String {
        format!("{}:parked_index", self.prefix)
    }

    /// Dispatched jobs awaiting a completion report (sorted set scored by
    /// dispatch time in ms).
    pub fn dispatched(&self) -> String {
        format!("{}:dispatched", self.prefix)
    }

    /// Monotonic park sequence counter.
    pub fn park_sequence(&self) -> String {
        format!("{}:parked_seq", self.prefix)
    }

    /// Repeating schedules due index (sorted set scored by next fire time in ms).
    pub fn schedules(&self) -> String {
        format!("{}:schedules", self.prefix)
    }

    /// In-flight counter for a tenant and job class.
    pub fn admission(&self, tenant_id: &str, class: JobClass) -> String {
        format!("{}:admission:{}:{}", self.prefix, tenant_id, class.as_str())
    }

    /// Dedup hit counter.
    pub fn dedup(&self, owner_id: &str, token: &str) -> String {
        format!("{}:dedup:{}:{}", self.prefix, owner_id, token)
    }

    /// Lock lease.
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    /// Worker free capacity (sorted set scored by free slots).
    pub fn worker_capacity(&self) -> String {
        format!("{}:workers:capacity", self.prefix)
    }

    /// Worker registrations (hash of worker id to JSON).
    pub fn worker_info(&self) -> String {
        format!("{}:workers:info", self.prefix)
    }

    /// Schema version marker.
    pub fn schema_version(&self) -> String {
        format!("{}:schema:version", self.prefix)
    }

    /// Single pending set used before per-class queues existed.
    pub fn legacy_pending(&self) -> String {
        format!("{}:pending", self.prefix)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("conveyor")
    }
}
