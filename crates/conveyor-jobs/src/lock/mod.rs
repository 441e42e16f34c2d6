//! Named mutual-exclusion locks.
//!
//! Two providers implement [`DistributedLock`]:
//!
//! - [`LocalLock`]: a process-wide registry of async mutexes, one per name,
//!   created on first use. For single-node deployments.
//! - [`LeaseLock`]: a quorum lease over one or more coordination stores. A
//!   crashed holder's lease expires on its own.
//!
//! Callers release the returned [`LockGuard`] on every exit path. Dropping a
//! lease guard without releasing it leaves the lease to expire.

mod lease;
mod local;

pub use lease::LeaseLock;
pub use local::LocalLock;

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

/// Lock name used by the schema migration sweep.
pub const MIGRATION_LOCK: &str = "migration";

/// Named lock provider.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `key`, waiting at most `timeout`.
    ///
    /// For lease-based providers `timeout` is also the lease length.
    /// Fails with `LockTimeout` when the deadline passes.
    async fn acquire(&self, key: &str, timeout: Duration) -> JobResult<LockGuard>;
}

/// A held lock.
#[must_use = "the lock is released when the guard is released or dropped"]
pub struct LockGuard {
    key: String,
    held: Held,
}

enum Held {
    Local(OwnedMutexGuard<()>),
    Lease(lease::Lease),
}

impl LockGuard {
    pub(crate) fn local(key: &str, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            key: key.to_string(),
            held: Held::Local(guard),
        }
    }

    pub(crate) fn lease(key: &str, lease: lease::Lease) -> Self {
        Self {
            key: key.to_string(),
            held: Held::Lease(lease),
        }
    }

    /// Lock name.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Time left on the lease; `None` for process-local locks.
    pub fn validity(&self) -> Option<Duration> {
        match &self.held {
            Held::Local(_) => None,
            Held::Lease(lease) => Some(lease.validity()),
        }
    }

    /// Extend the lease by `ttl`. Returns false when the lease was lost.
    pub async fn renew(&mut self, ttl: Duration) -> JobResult<bool> {
        match &mut self.held {
            Held::Local(_) => Ok(true),
            Held::Lease(lease) => lease.renew(ttl).await,
        }
    }

    /// Drive `work` to completion while keeping the lease alive, renewing it
    /// by `ttl` every third of `ttl`.
    ///
    /// When the lease is lost `work` is dropped and the call fails with
    /// `LockTimeout`. Process-local locks never expire, so `work` simply runs.
    pub async fn renew_while<F, T>(&mut self, ttl: Duration, work: F) -> JobResult<T>
    where
        F: Future<Output = JobResult<T>>,
    {
        if matches!(self.held, Held::Local(_)) {
            return work.await;
        }

        tokio::pin!(work);
        let started = Instant::now();
        let period = (ttl / 3).max(Duration::from_millis(1));
        let mut renewal = tokio::time::interval_at(started + period, period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renewal.tick() => match self.renew(ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(JobError::LockTimeout {
                            key: self.key.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    Err(e) => warn!(lock = %self.key, error = %e, "Lease renewal failed"),
                },
            }
        }
    }

    /// Release the lock.
    pub async fn release(self) -> JobResult<()> {
        match self.held {
            Held::Local(guard) => {
                drop(guard);
                Ok(())
            }
            Held::Lease(lease) => lease.release().await,
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Shared lock provider handle.
pub type SharedLock = Arc<dyn DistributedLock>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::keys::StoreKeys;
    use crate::store::{CoordinationStore, MemoryStore};

    fn lease_lock(store: &Arc<dyn CoordinationStore>) -> LeaseLock {
        LeaseLock::new(vec![store.clone()], StoreKeys::new("t"), LockConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_while_outlives_the_first_lease() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let holder = lease_lock(&store);
        let contender = lease_lock(&store);
        let mut guard = holder.acquire("sweep", Duration::from_secs(3)).await.unwrap();

        let contended = guard
            .renew_while(Duration::from_secs(3), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(contender.acquire("sweep", Duration::from_millis(100)).await.is_err())
            })
            .await
            .unwrap();

        assert!(contended);
        guard.release().await.unwrap();
        assert!(store.get("t:lock:sweep").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_while_stops_when_the_lease_is_lost() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let holder = lease_lock(&store);
        let mut guard = holder.acquire("sweep", Duration::from_secs(3)).await.unwrap();

        let result = guard
            .renew_while(Duration::from_secs(3), async {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                store.delete("t:lock:sweep").await?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(JobError::LockTimeout { key, .. }) if key == "sweep"));
    }

    #[tokio::test]
    async fn test_renew_while_on_local_lock_runs_work() {
        let lock = LocalLock::new();
        let mut guard = lock.acquire("sweep", Duration::from_millis(50)).await.unwrap();
        let value = guard
            .renew_while(Duration::from_millis(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        guard.release().await.unwrap();
    }
}
