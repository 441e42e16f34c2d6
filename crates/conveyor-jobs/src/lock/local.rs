//! Process-local locks.

use super::{DistributedLock, LockGuard};
use crate::error::{JobError, JobResult};
use crate::metrics::LockMetrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Registry of one async mutex per lock name.
#[derive(Default)]
pub struct LocalLock {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLock {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> JobResult<LockGuard> {
        let mutex = self.entry(key);

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!(lock = %key, "Acquired local lock");
                Ok(LockGuard::local(key, guard))
            }
            Err(_) => {
                LockMetrics::timeout(key);
                Err(JobError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let locks = LocalLock::new();
        let guard = locks.acquire("x", Duration::from_millis(50)).await.unwrap();

        let second = locks.acquire("x", Duration::from_millis(20)).await;
        assert!(matches!(second, Err(JobError::LockTimeout { .. })));

        guard.release().await.unwrap();
        let third = locks.acquire("x", Duration::from_millis(20)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = LocalLock::new();
        let _a = locks.acquire("a", Duration::from_millis(10)).await.unwrap();
        let b = locks.acquire("b", Duration::from_millis(10)).await.unwrap();
        assert_eq!(b.key(), "b");
        assert!(b.validity().is_none());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = Arc::new(LocalLock::new());
        let guard = locks.acquire("x", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("x", Duration::from_secs(1)).await.map(|g| g.key().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        guard.release().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "x");
    }
}
