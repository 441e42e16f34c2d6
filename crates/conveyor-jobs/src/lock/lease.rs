//! Quorum lease locks over coordination stores.

use super::{DistributedLock, LockGuard};
use crate::config::LockConfig;
use crate::error::{JobError, JobResult};
use crate::keys::StoreKeys;
use crate::metrics::LockMetrics;
use crate::store::CoordinationStore;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fixed drift allowance added to the proportional one.
const DRIFT_FLOOR: Duration = Duration::from_millis(2);

/// Lease lock granted by a majority of independent stores.
///
/// Each attempt writes a random token with `SET NX PX` to every store. The
/// lock is granted when a majority accepted and the lease still has time left
/// after subtracting the attempt duration and the clock drift allowance.
/// Otherwise the partial grants are rolled back and the attempt is retried
/// with exponential backoff until the wait deadline.
pub struct LeaseLock {
    stores: Vec<Arc<dyn CoordinationStore>>,
    keys: StoreKeys,
    config: LockConfig,
}

impl LeaseLock {
    /// Creates a lease lock over `stores`. A single store is its own quorum.
    pub fn new(stores: Vec<Arc<dyn CoordinationStore>>, keys: StoreKeys, config: LockConfig) -> JobResult<Self> {
        if stores.is_empty() {
            return Err(JobError::Configuration(
                "lease lock needs at least one store".into(),
            ));
        }
        Ok(Self { stores, keys, config })
    }

    fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    fn drift(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.config.clock_drift_factor.max(0.0)) + DRIFT_FLOOR
    }

    /// One round over every store. Returns the validity left when granted.
    async fn try_lease(&self, lock_key: &str, token: &str, ttl: Duration) -> JobResult<Option<Duration>> {
        let started = Instant::now();
        let mut granted = 0;
        let mut failures = 0;
        let mut last_error = None;

        for store in &self.stores {
            match store.set_nx(lock_key, token, Some(ttl)).await {
                Ok(true) => granted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(lock = %lock_key, backend = store.backend(), error = %e, "Lock node unavailable");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        let validity = ttl
            .checked_sub(started.elapsed())
            .and_then(|left| left.checked_sub(self.drift(ttl)));

        if granted >= self.quorum() {
            if let Some(validity) = validity.filter(|v| !v.is_zero()) {
                return Ok(Some(validity));
            }
        }

        self.rollback(lock_key, token).await;

        // No node answered at all: surface the outage instead of waiting it out.
        match last_error {
            Some(e) if failures == self.stores.len() => Err(e),
            _ => Ok(None),
        }
    }

    async fn rollback(&self, lock_key: &str, token: &str) {
        for store in &self.stores {
            if let Err(e) = store.compare_and_delete(lock_key, token).await {
                debug!(lock = %lock_key, error = %e, "Lock rollback failed; lease will expire");
            }
        }
    }
}

#[async_trait]
impl DistributedLock for LeaseLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> JobResult<LockGuard> {
        let lock_key = self.keys.lock(key);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.retry_initial_ms))
            .with_max_interval(Duration::from_millis(self.config.retry_max_ms))
            .with_max_elapsed_time(None)
            .build();

        loop {
            if let Some(validity) = self.try_lease(&lock_key, &token, timeout).await? {
                debug!(lock = %key, validity_ms = validity.as_millis() as u64, "Acquired lease");
                return Ok(LockGuard::lease(
                    key,
                    Lease {
                        stores: self.stores.clone(),
                        lock_key,
                        token,
                        quorum: self.quorum(),
                        expires_at: Instant::now() + validity,
                    },
                ));
            }

            let waited = started.elapsed();
            if waited >= timeout {
                LockMetrics::timeout(key);
                return Err(JobError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            let pause = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_millis(self.config.retry_max_ms));
            tokio::time::sleep(pause.min(timeout - waited)).await;
        }
    }
}

/// A granted lease.
pub(crate) struct Lease {
    stores: Vec<Arc<dyn CoordinationStore>>,
    lock_key: String,
    token: String,
    quorum: usize,
    expires_at: Instant,
}

impl Lease {
    pub(crate) fn validity(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Extends the lease on every store that still holds our token.
    pub(crate) async fn renew(&mut self, ttl: Duration) -> JobResult<bool> {
        let started = Instant::now();
        let mut renewed = 0;
        for store in &self.stores {
            match store.compare_and_expire(&self.lock_key, &self.token, ttl).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(e) => warn!(lock = %self.lock_key, error = %e, "Lease renewal failed on node"),
            }
        }

        if renewed >= self.quorum {
            self.expires_at = started + ttl;
            Ok(true)
        } else {
            warn!(lock = %self.lock_key, renewed, quorum = self.quorum, "Lease lost");
            Ok(false)
        }
    }

    /// Deletes the lease where it still carries our token.
    pub(crate) async fn release(self) -> JobResult<()> {
        let mut last_error = None;
        let mut reached = 0;
        for store in &self.stores {
            match store.compare_and_delete(&self.lock_key, &self.token).await {
                Ok(_) => reached += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if reached == 0 => Err(e),
            _ => {
                debug!(lock = %self.lock_key, "Released lease");
                Ok(())
            }
        }
    }
}
