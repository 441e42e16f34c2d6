//! Deduplication windows and lock mutual exclusion.

use conveyor_jobs::{
    CoordinationStore, DedupConfig, Deduplicator, DistributedLock, JobError, LeaseLock,
    LocalLock, LockConfig, MemoryStore, StoreKeys, MIGRATION_LOCK,
};
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn deduplicator(ttl_secs: u64) -> Deduplicator {
    let config = DedupConfig {
        ttl_secs,
        ..DedupConfig::default()
    };
    Deduplicator::new(Arc::new(MemoryStore::new()), StoreKeys::new("it"), &config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_pass_once() {
    let dedup = Arc::new(deduplicator(30));

    let calls = (0..10).map(|_| {
        let dedup = dedup.clone();
        tokio::spawn(async move {
            dedup
                .filter("trigger-1", vec![json!({"dedupe_key": "evt-42"})])
                .await
                .unwrap()
                .len()
        })
    });
    let passed: usize = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .sum();

    assert_eq!(passed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_token_passes_again_after_window() {
    let dedup = deduplicator(30);
    let payload = || vec![json!({"dedupe_key": "evt-1"})];

    assert_eq!(dedup.filter("t", payload()).await.unwrap().len(), 1);
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(dedup.filter("t", payload()).await.unwrap().is_empty());

    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(dedup.filter("t", payload()).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_counter_left_without_expiry_is_rearmed() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let dedup = Deduplicator::new(store.clone(), StoreKeys::new("it"), &DedupConfig::default());
    store.incr_by("it:dedup:t:evt-1", 1).await.unwrap();
    let payload = || vec![json!({"dedupe_key": "evt-1"})];

    assert!(dedup.filter("t", payload()).await.unwrap().is_empty());
    assert!(store.ttl("it:dedup:t:evt-1").await.unwrap().is_some());

    tokio::time::advance(dedup.ttl() + Duration::from_secs(1)).await;
    assert_eq!(dedup.filter("t", payload()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_owners_have_separate_windows() {
    let dedup = deduplicator(30);
    let payload = json!({"dedupe_key": "evt-1"});

    assert_eq!(dedup.filter("a", vec![payload.clone()]).await.unwrap().len(), 1);
    assert_eq!(dedup.filter("b", vec![payload]).await.unwrap().len(), 1);
}

async fn assert_mutual_exclusion(lock: Arc<dyn DistributedLock>) {
    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));

    let tasks = (0..8).map(|_| {
        let lock = lock.clone();
        let holders = holders.clone();
        let max_holders = max_holders.clone();
        tokio::spawn(async move {
            let guard = lock.acquire("shared", Duration::from_secs(5)).await.unwrap();
            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
            max_holders.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            guard.release().await.unwrap();
        })
    });
    for joined in join_all(tasks).await {
        joined.unwrap();
    }

    assert_eq!(max_holders.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_lock_is_exclusive() {
    assert_mutual_exclusion(Arc::new(LocalLock::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_lock_is_exclusive() {
    let stores: Vec<Arc<dyn CoordinationStore>> = (0..3)
        .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn CoordinationStore>)
        .collect();
    let lock = LeaseLock::new(stores, StoreKeys::new("it"), LockConfig::default()).unwrap();
    assert_mutual_exclusion(Arc::new(lock)).await;
}

#[tokio::test]
async fn test_lock_times_out_while_held() {
    let lock = LocalLock::new();
    let guard = lock.acquire("migration", Duration::from_secs(1)).await.unwrap();

    let result = lock.acquire("migration", Duration::from_millis(30)).await;
    assert!(matches!(result, Err(JobError::LockTimeout { .. })));

    guard.release().await.unwrap();
    let again = lock.acquire("migration", Duration::from_millis(30)).await.unwrap();
    again.release().await.unwrap();
}

#[tokio::test]
async fn test_different_keys_do_not_contend() {
    let lock = LocalLock::new();
    let a = lock.acquire("a", Duration::from_millis(30)).await.unwrap();
    let b = lock.acquire("b", Duration::from_millis(30)).await.unwrap();
    a.release().await.unwrap();
    b.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_long_holder_keeps_lease_through_renewal() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let holder = LeaseLock::new(vec![store.clone()], StoreKeys::new("it"), LockConfig::default()).unwrap();
    let contender =
        LeaseLock::new(vec![store.clone()], StoreKeys::new("it"), LockConfig::default()).unwrap();
    let lease = Duration::from_millis(300);

    let mut guard = holder.acquire(MIGRATION_LOCK, lease).await.unwrap();
    let blocked = guard
        .renew_while(lease, async {
            tokio::time::sleep(Duration::from_millis(700)).await;
            let early = contender.acquire(MIGRATION_LOCK, Duration::from_millis(50)).await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(matches!(early, Err(JobError::LockTimeout { .. })))
        })
        .await
        .unwrap();
    assert!(blocked);

    guard.release().await.unwrap();
    let after = contender.acquire(MIGRATION_LOCK, Duration::from_millis(50)).await.unwrap();
    after.release().await.unwrap();
}
