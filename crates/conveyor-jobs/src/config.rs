//! Dispatch core configuration.

use crate::error::{JobError, JobResult};
use crate::job::JobClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the dispatch core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Coordination backend selection.
    #[serde(default)]
    pub mode: QueueMode,

    /// Redis connection configuration (clustered mode).
    #[serde(default)]
    pub redis: RedisConfig,

    /// Per-tenant admission control.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Duplicate event suppression.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Distributed lock timings.
    #[serde(default)]
    pub lock: LockConfig,

    /// Worker capacity routing.
    #[serde(default)]
    pub router: RouterConfig,

    /// Retry policy for failed jobs.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Dispatcher loop.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl JobsConfig {
    /// Checks the invariants the rest of the crate relies on.
    pub fn validate(&self) -> JobResult<()> {
        if self.redis.key_prefix.is_empty() {
            return Err(JobError::Configuration("redis.key_prefix must not be empty".into()));
        }
        if self.mode == QueueMode::Redis && self.redis.url.is_empty() {
            return Err(JobError::Configuration("redis.url is required in redis mode".into()));
        }
        if self.admission.max_concurrent_per_tenant == 0 {
            return Err(JobError::Configuration(
                "admission.max_concurrent_per_tenant must be positive".into(),
            ));
        }
        if let Some((name, _)) = self
            .admission
            .class_ceilings
            .iter()
            .chain(self.admission.tenant_ceilings.iter())
            .find(|(_, ceiling)| **ceiling == 0)
        {
            return Err(JobError::Configuration(format!(
                "admission ceiling for {} must be positive",
                name
            )));
        }
        let mut classes = Vec::with_capacity(self.admission.class_ceilings.len());
        for key in self.admission.class_ceilings.keys() {
            let class = key.parse::<JobClass>().map_err(JobError::Configuration)?;
            if classes.contains(&class) {
                return Err(JobError::Configuration(format!(
                    "admission ceiling for {} is set more than once",
                    class
                )));
            }
            classes.push(class);
        }
        if self.dedup.ttl_secs == 0 {
            return Err(JobError::Configuration("dedup.ttl_secs must be positive".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(JobError::Configuration("retry.multiplier must be >= 1.0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(JobError::Configuration("retry.max_attempts must be positive".into()));
        }
        if self.dispatcher.queues.is_empty() {
            return Err(JobError::Configuration("dispatcher.queues must not be empty".into()));
        }
        Ok(())
    }
}

/// Coordination backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Single process, in-memory store and process-local locks.
    #[default]
    Memory,
    /// Shared Redis store and lease-based locks.
    Redis,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all dispatch keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Additional independent nodes for the lock quorum.
    #[serde(default)]
    pub lock_urls: Vec<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
            lock_urls: Vec::new(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "conveyor".to_string()
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Enable per-tenant concurrency ceilings.
    #[serde(default = "default_admission_enabled")]
    pub enabled: bool,

    /// Default ceiling of in-flight jobs per tenant and job class.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_tenant: u32,

    /// Ceiling overrides keyed by job class name.
    #[serde(default)]
    pub class_ceilings: HashMap<String, u32>,

    /// Ceiling overrides keyed by tenant id.
    #[serde(default)]
    pub tenant_ceilings: HashMap<String, u32>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: default_admission_enabled(),
            max_concurrent_per_tenant: default_max_concurrent(),
            class_ceilings: HashMap::new(),
            tenant_ceilings: HashMap::new(),
        }
    }
}

impl AdmissionConfig {
    /// Resolves the ceiling for a tenant and class.
    ///
    /// Tenant overrides win over class overrides, which win over the default.
    /// Class keys match the way class names parse, so `ONE_TIME` and
    /// `one_time` name the same override.
    pub fn ceiling_for(&self, class: JobClass, tenant_id: &str) -> u32 {
        self.tenant_ceilings
            .get(tenant_id)
            .or_else(|| {
                self.class_ceilings
                    .iter()
                    .find(|(key, _)| key.parse::<JobClass>().is_ok_and(|parsed| parsed == class))
                    .map(|(_, ceiling)| ceiling)
            })
            .copied()
            .unwrap_or(self.max_concurrent_per_tenant)
    }
}

fn default_admission_enabled() -> bool {
    true
}

fn default_max_concurrent() -> u32 {
    100
}

/// Deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Window during which repeats of a token are dropped.
    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,

    /// JSON pointer of the dedup token inside a payload.
    #[serde(default = "default_token_pointer")]
    pub token_pointer: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl(),
            token_pointer: default_token_pointer(),
        }
    }
}

impl DedupConfig {
    /// Returns the dedup window as Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_dedup_ttl() -> u64 {
    30
}

fn default_token_pointer() -> String {
    "/dedupe_key".to_string()
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Default acquisition timeout and lease length in milliseconds.
    #[serde(default = "default_lock_timeout")]
    pub default_timeout_ms: u64,

    /// Timeout used by long-running sweeps.
    #[serde(default = "default_sweep_timeout")]
    pub sweep_timeout_ms: u64,

    /// First retry delay while the lock is contended.
    #[serde(default = "default_lock_retry_initial")]
    pub retry_initial_ms: u64,

    /// Largest retry delay while the lock is contended.
    #[serde(default = "default_lock_retry_max")]
    pub retry_max_ms: u64,

    /// Clock drift allowance as a fraction of the lease length.
    #[serde(default = "default_clock_drift")]
    pub clock_drift_factor: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_lock_timeout(),
            sweep_timeout_ms: default_sweep_timeout(),
            retry_initial_ms: default_lock_retry_initial(),
            retry_max_ms: default_lock_retry_max(),
            clock_drift_factor: default_clock_drift(),
        }
    }
}

impl LockConfig {
    /// Returns the default lock timeout as Duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Returns the sweep lock timeout as Duration.
    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.sweep_timeout_ms)
    }
}

fn default_lock_timeout() -> u64 {
    3_000
}

fn default_sweep_timeout() -> u64 {
    20_000
}

fn default_lock_retry_initial() -> u64 {
    25
}

fn default_lock_retry_max() -> u64 {
    400
}

fn default_clock_drift() -> f64 {
    0.01
}

/// Worker routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Atomic highest-free-capacity selection in the coordination store.
    #[default]
    Capacity,
    /// Most recently registered worker, no capacity accounting.
    Simple,
}

/// Worker routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Routing strategy.
    #[serde(default)]
    pub strategy: RoutingStrategy,

    /// Bounded wait for a free slot in milliseconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Heartbeat age after which the liveness checker should disconnect a worker.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            acquire_timeout_ms: default_acquire_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl RouterConfig {
    /// Returns the acquire timeout as Duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Returns the heartbeat timeout as Duration.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

fn default_acquire_timeout() -> u64 {
    5_000
}

fn default_heartbeat_timeout() -> u64 {
    90
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    480_000 // 8 minutes
}

fn default_max_delay() -> u64 {
    3_600_000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

/// Dispatcher loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Sleep between idle polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Queues to poll, in order.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Upper bound of the pause while the backend is unavailable.
    #[serde(default = "default_max_backend_backoff")]
    pub max_backend_backoff_ms: u64,

    /// Due entries moved per pump tick.
    #[serde(default = "default_pump_batch_size")]
    pub pump_batch_size: usize,

    /// Execution timeout per job in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Grace period for running jobs at shutdown in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Extra time past the job timeout before an unreported dispatch is
    /// recovered, in seconds.
    #[serde(default = "default_stall_grace")]
    pub stall_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            queues: default_queues(),
            max_backend_backoff_ms: default_max_backend_backoff(),
            pump_batch_size: default_pump_batch_size(),
            job_timeout_secs: default_job_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            stall_grace_secs: default_stall_grace(),
        }
    }
}

impl DispatcherConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the backend pause cap as Duration.
    pub fn max_backend_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backend_backoff_ms)
    }

    /// Returns job timeout as Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Age after which a dispatch without a completion report is recovered.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs.saturating_add(self.stall_grace_secs))
    }
}

fn default_poll_interval() -> u64 {
    250
}

fn default_queues() -> Vec<String> {
    vec![
        "webhooks".to_string(),
        "one_time".to_string(),
        "scheduled".to_string(),
    ]
}

fn default_max_backend_backoff() -> u64 {
    30_000
}

fn default_pump_batch_size() -> usize {
    100
}

fn default_job_timeout() -> u64 {
    600
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_stall_grace() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.mode, QueueMode::Memory);
        assert_eq!(config.dedup.ttl(), Duration::from_secs(30));
        assert_eq!(config.lock.default_timeout(), Duration::from_secs(3));
        assert_eq!(config.lock.sweep_timeout(), Duration::from_secs(20));
        assert_eq!(config.retry.initial_delay_ms, 480_000);
        assert_eq!(config.router.strategy, RoutingStrategy::Capacity);
        assert_eq!(config.dispatcher.stall_timeout(), Duration::from_secs(660));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ceiling_resolution_order() {
        let mut admission = AdmissionConfig::default();
        admission.max_concurrent_per_tenant = 10;
        admission.class_ceilings.insert("webhook".into(), 4);
        admission.tenant_ceilings.insert("acme".into(), 1);

        assert_eq!(admission.ceiling_for(JobClass::OneTime, "other"), 10);
        assert_eq!(admission.ceiling_for(JobClass::Webhook, "other"), 4);
        assert_eq!(admission.ceiling_for(JobClass::Webhook, "acme"), 1);
    }

    #[test]
    fn test_class_override_keys_ignore_case() {
        let mut config = JobsConfig::default();
        config.admission.class_ceilings.insert("ONE_TIME".into(), 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.ceiling_for(JobClass::OneTime, "acme"), 2);
        assert_eq!(config.admission.ceiling_for(JobClass::Webhook, "acme"), 100);

        config.admission.class_ceilings.insert("one_time".into(), 3);
        assert!(matches!(config.validate(), Err(JobError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let mut config = JobsConfig::default();
        config.admission.tenant_ceilings.insert("acme".into(), 0);
        assert!(matches!(config.validate(), Err(JobError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_class_override() {
        let mut config = JobsConfig::default();
        config.admission.class_ceilings.insert("nightly".into(), 3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_redis_without_url() {
        let mut config = JobsConfig::default();
        config.mode = QueueMode::Redis;
        config.redis.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let config: JobsConfig = serde_json::from_str(
            r#"{"mode":"redis","admission":{"max_concurrent_per_tenant":2},"router":{"strategy":"simple"}}"#,
        )
        .unwrap();
        assert_eq!(config.mode, QueueMode::Redis);
        assert_eq!(config.admission.max_concurrent_per_tenant, 2);
        assert!(config.admission.enabled);
        assert_eq!(config.router.strategy, RoutingStrategy::Simple);
        assert_eq!(config.redis.key_prefix, "conveyor");
    }
}
