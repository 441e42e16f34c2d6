//! Builds the dispatch core for a configured mode.

use crate::admission::AdmissionController;
use crate::config::{JobsConfig, QueueMode, RoutingStrategy};
use crate::dedup::Deduplicator;
use crate::dispatcher::{Dispatcher, DispatcherSettings, JobExecutor};
use crate::error::JobResult;
use crate::keys::StoreKeys;
use crate::lock::{LeaseLock, LocalLock, SharedLock};
use crate::migration::{MigrationReport, MigrationSweep};
use crate::queue::QueueManager;
use crate::retry::RetryPolicy;
use crate::router::{CapacityRouter, SimpleRouter, WorkerRouter};
use crate::store::{CoordinationStore, MemoryStore, RedisStore};
use std::sync::Arc;
use tracing::info;

/// The assembled dispatch core.
pub struct DispatchCore {
    config: JobsConfig,
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    queue: Arc<QueueManager>,
    dedup: Arc<Deduplicator>,
    lock: SharedLock,
    router: Arc<dyn WorkerRouter>,
}

impl DispatchCore {
    /// Builds the core for the configured mode and routing strategy.
    ///
    /// Redis mode connects to the primary store and every extra lock node up
    /// front, so an unreachable backend fails here rather than on first use.
    pub async fn build(config: &JobsConfig) -> JobResult<Self> {
        config.validate()?;
        let keys = StoreKeys::new(config.redis.key_prefix.clone());

        let (store, lock): (Arc<dyn CoordinationStore>, SharedLock) = match config.mode {
            QueueMode::Memory => (Arc::new(MemoryStore::new()), Arc::new(LocalLock::new())),
            QueueMode::Redis => {
                let primary: Arc<dyn CoordinationStore> =
                    Arc::new(RedisStore::connect(&config.redis.url, &config.redis).await?);

                let mut lock_stores = vec![primary.clone()];
                for url in &config.redis.lock_urls {
                    lock_stores.push(Arc::new(RedisStore::connect(url, &config.redis).await?));
                }
                let lock = LeaseLock::new(lock_stores, keys.clone(), config.lock.clone())?;
                (primary, Arc::new(lock))
            }
        };

        Ok(Self::assemble(config, store, lock, keys))
    }

    /// Builds a single-process core over an in-memory store.
    pub fn in_memory(config: &JobsConfig) -> Self {
        let keys = StoreKeys::new(config.redis.key_prefix.clone());
        Self::assemble(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalLock::new()),
            keys,
        )
    }

    /// Builds a core over an existing store and lock provider.
    pub fn with_store(config: &JobsConfig, store: Arc<dyn CoordinationStore>, lock: SharedLock) -> Self {
        let keys = StoreKeys::new(config.redis.key_prefix.clone());
        Self::assemble(config, store, lock, keys)
    }

    fn assemble(
        config: &JobsConfig,
        store: Arc<dyn CoordinationStore>,
        lock: SharedLock,
        keys: StoreKeys,
    ) -> Self {
        let router: Arc<dyn WorkerRouter> = match config.router.strategy {
            RoutingStrategy::Capacity => Arc::new(CapacityRouter::new(store.clone(), keys.clone())),
            RoutingStrategy::Simple => Arc::new(SimpleRouter::new()),
        };
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            keys.clone(),
            config.admission.clone(),
        ));
        let queue = Arc::new(QueueManager::new(
            store.clone(),
            keys.clone(),
            admission,
            router.clone(),
            RetryPolicy::from(&config.retry),
            config.dispatcher.pump_batch_size,
        )
        .with_stall_timeout(config.dispatcher.stall_timeout()));
        let dedup = Arc::new(Deduplicator::new(store.clone(), keys.clone(), &config.dedup));

        info!(
            mode = ?config.mode,
            backend = store.backend(),
            strategy = router.strategy(),
            "Dispatch core assembled"
        );

        Self {
            config: config.clone(),
            store,
            keys,
            queue,
            dedup,
            lock,
            router,
        }
    }

    /// Queue manager.
    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    /// Deduplication service.
    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    /// Lock provider.
    pub fn lock(&self) -> &SharedLock {
        &self.lock
    }

    /// Worker router.
    pub fn router(&self) -> &Arc<dyn WorkerRouter> {
        &self.router
    }

    /// Admission controller.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        self.queue.admission()
    }

    /// Coordination store.
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Configuration the core was built from.
    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Creates the migration sweep for this core.
    pub fn migration(&self) -> MigrationSweep {
        MigrationSweep::new(
            self.store.clone(),
            self.keys.clone(),
            self.lock.clone(),
            self.queue.clone(),
            self.config.lock.sweep_timeout(),
            self.config.retry.max_attempts,
        )
    }

    /// Runs the migration sweep.
    pub async fn migrate(&self) -> JobResult<MigrationReport> {
        self.migration().run().await
    }

    /// Creates a dispatcher feeding `executor`.
    pub fn dispatcher(&self, executor: Arc<dyn JobExecutor>) -> Dispatcher {
        Dispatcher::new(
            self.queue.clone(),
            executor,
            DispatcherSettings::from(&self.config),
        )
    }
}
