//! Conveyor Jobs - Multi-Tenant Job Dispatch Core
//!
//! Accepts jobs from producers, holds them in durable priority queues, and
//! hands them to a fleet of workers without oversubscribing any worker or
//! letting one tenant starve the others:
//! - One-time, delayed, webhook and cron-driven repeating jobs
//! - Per-tenant, per-class admission ceilings with FIFO overflow
//! - Capacity-aware worker routing with atomic slot accounting
//! - Payload deduplication within a time window
//! - Named distributed locks (single-process or quorum lease)
//! - Lock-guarded schema migration of persisted records
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Conveyor Dispatch Architecture                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer ──► Deduplicator ──► QueueManager::add                 │
//! │                                     │                            │
//! │                 ┌───────────────────┼───────────────────┐        │
//! │                 ▼                   ▼                   ▼        │
//! │           ┌──────────┐       ┌─────────────┐     ┌──────────┐    │
//! │           │ Delayed  │       │  Admission  │     │Schedules │    │
//! │           └────┬─────┘       │ Controller  │     └────┬─────┘    │
//! │                │ pump        └──┬───────┬──┘          │ pump     │
//! │                └──────────────► │       │ ◄───────────┘          │
//! │                          admit  ▼       ▼ park                   │
//! │                   ┌──────────────┐  ┌──────────────┐             │
//! │                   │Active queues │  │Parked (FIFO) │             │
//! │                   └──────┬───────┘  └──────▲───────┘             │
//! │                          │ dequeue         │ promote             │
//! │                          ▼                 │                     │
//! │  ┌────────────┐   ┌──────────────┐   ┌─────┴───────┐             │
//! │  │WorkerRouter│──►│  Dispatcher  │──►│   finish    │             │
//! │  │ (slots)    │◄──│  + Executor  │   │ retry/drop  │             │
//! │  └────────────┘   └──────────────┘   └─────────────┘             │
//! │                                                                  │
//! │  CoordinationStore (memory | Redis) underneath everything;       │
//! │  DistributedLock and MigrationSweep alongside.                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_jobs::{DispatchCore, JobSpec, JobsConfig, Priority};
//! use serde_json::json;
//!
//! let core = DispatchCore::build(&JobsConfig::default()).await?;
//! core.queue().init().await?;
//! core.migrate().await?;
//!
//! core.queue()
//!     .add(JobSpec::webhook("acme", json!({"event": "push"})).priority(Priority::High))
//!     .await?;
//! ```

pub mod admission;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod job;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod migration;
pub mod queue;
pub mod retry;
pub mod router;
pub mod schedule;
pub mod store;

pub use admission::AdmissionController;
pub use config::{
    AdmissionConfig, DedupConfig, DispatcherConfig, JobsConfig, LockConfig, QueueMode, RedisConfig,
    RetryConfig, RouterConfig, RoutingStrategy,
};
pub use dedup::Deduplicator;
pub use dispatcher::{Dispatcher, DispatcherSettings, JobExecutor, Tick};
pub use error::{JobError, JobResult};
pub use factory::DispatchCore;
pub use job::{
    AddOutcome, Disposition, JobClass, JobId, JobRecord, JobSpec, JobState, Priority,
    CURRENT_SCHEMA_VERSION,
};
pub use keys::StoreKeys;
pub use lock::{DistributedLock, LeaseLock, LocalLock, LockGuard, SharedLock, MIGRATION_LOCK};
pub use metrics::{
    register_metrics, DedupMetrics, JobMetrics, LockMetrics, MaintenanceMetrics, RouterMetrics,
};
pub use migration::{MigrationReport, MigrationSweep, VersionedJobRecord};
pub use queue::{JobFinished, JobOutcome, PumpReport, QueueManager};
pub use retry::RetryPolicy;
pub use router::{
    CapacityRouter, SimpleRouter, WorkerHeartbeat, WorkerRegistration, WorkerRouter,
    WorkerSnapshot,
};
pub use schedule::{cron_expressions, CronSchedule};
pub use store::{CoordinationStore, MemoryStore, RedisStore};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::dispatcher::JobExecutor;
    pub use crate::job::{JobClass, JobSpec, Priority};
    pub use crate::lock::DistributedLock;
    pub use crate::router::WorkerRouter;
    pub use crate::store::CoordinationStore;
    pub use crate::{JobError, JobId, JobResult};
}
