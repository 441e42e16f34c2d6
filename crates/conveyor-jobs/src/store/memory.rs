//! In-process coordination store for single-node deployments and tests.

use super::CoordinationStore;
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Store holding all state behind one mutex.
///
/// Every method takes the lock once, so each operation is atomic with respect
/// to every other. Expiry is applied lazily when a key is touched.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct State {
    strings: HashMap<String, String>,
    zsets: HashMap<String, SortedSet>,
    hashes: HashMap<String, HashMap<String, String>>,
    expiries: HashMap<String, Instant>,
}

impl State {
    fn purge(&mut self, key: &str) {
        let expired = self
            .expiries
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if expired {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        let string = self.strings.remove(key).is_some();
        let zset = self.zsets.remove(key).is_some();
        let hash = self.hashes.remove(key).is_some();
        string || zset || hash
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.zsets.contains_key(key) || self.hashes.contains_key(key)
    }

    fn set_expiry(&mut self, key: &str, ttl: Option<Duration>) {
        match ttl {
            Some(ttl) => {
                self.expiries.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                self.expiries.remove(key);
            }
        }
    }

    fn string(&mut self, key: &str) -> Option<&String> {
        self.purge(key);
        self.strings.get(key)
    }

    fn zset(&mut self, key: &str) -> Option<&mut SortedSet> {
        self.purge(key);
        self.zsets.get_mut(key)
    }

    fn zset_or_default(&mut self, key: &str) -> &mut SortedSet {
        self.purge(key);
        self.zsets.entry(key.to_string()).or_default()
    }

    fn incr(&mut self, key: &str, delta: i64) -> JobResult<i64> {
        let current = match self.string(key) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| JobError::Backend(format!("value at {} is not an integer", key)))?,
            None => 0,
        };
        let next = current + delta;
        self.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.zsets.get(key).is_some_and(SortedSet::is_empty) {
            self.zsets.remove(key);
            self.expiries.remove(key);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(Score(old), member.to_string()));
        }
        self.order.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> Option<f64> {
        let old = self.scores.remove(member)?;
        self.order.remove(&(Score(old), member.to_string()));
        Some(old)
    }

    fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    fn pop_min(&mut self) -> Option<(String, f64)> {
        let (score, member) = self.order.pop_first()?;
        self.scores.remove(&member);
        Some((member, score.0))
    }

    fn max(&self) -> Option<(String, f64)> {
        self.order
            .last()
            .map(|(score, member)| (member.clone(), score.0))
    }

    fn range(&self, min: f64, max: f64, limit: usize) -> Vec<(String, f64)> {
        self.order
            .range((Score(min), String::new())..)
            .take_while(|(score, _)| score.0 <= max)
            .take(limit)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> JobResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> JobResult<Option<String>> {
        let mut state = self.state.lock();
        Ok(state.string(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<()> {
        let mut state = self.state.lock();
        state.remove(key);
        state.strings.insert(key.to_string(), value.to_string());
        state.set_expiry(key, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.exists(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state.set_expiry(key, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.remove(key))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        if state.string(key).map(String::as_str) == Some(expected) {
            state.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> JobResult<bool> {
        let mut state = self.state.lock();
        if state.string(key).map(String::as_str) == Some(expected) {
            state.set_expiry(key, Some(ttl));
            return Ok(true);
        }
        Ok(false)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> JobResult<i64> {
        self.state.lock().incr(key, delta)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> JobResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if !state.exists(key) {
            return Ok(false);
        }
        state.set_expiry(key, Some(ttl));
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> JobResult<Option<Duration>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state
            .expiries
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now())))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> JobResult<()> {
        let mut state = self.state.lock();
        state.zset_or_default(key).insert(member, score);
        Ok(())
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> JobResult<f64> {
        let mut state = self.state.lock();
        let set = state.zset_or_default(key);
        let next = set.score(member).unwrap_or(0.0) + delta;
        set.insert(member, next);
        Ok(next)
    }

    async fn zrem(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        let removed = state
            .zset(key)
            .and_then(|set| set.remove(member))
            .is_some();
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> JobResult<Option<f64>> {
        let mut state = self.state.lock();
        Ok(state.zset(key).and_then(|set| set.score(member)))
    }

    async fn zpop_min(&self, key: &str) -> JobResult<Option<(String, f64)>> {
        let mut state = self.state.lock();
        let popped = state.zset(key).and_then(SortedSet::pop_min);
        state.drop_if_empty(key);
        Ok(popped)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> JobResult<Vec<(String, f64)>> {
        let mut state = self.state.lock();
        Ok(state
            .zset(key)
            .map(|set| set.range(min, max, limit))
            .unwrap_or_default())
    }

    async fn zcard(&self, key: &str) -> JobResult<u64> {
        let mut state = self.state.lock();
        Ok(state.zset(key).map_or(0, |set| set.len() as u64))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> JobResult<()> {
        let mut state = self.state.lock();
        state.purge(key);
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> JobResult<Option<String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.hashes.get(key).and_then(|hash| hash.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        let removed = match state.hashes.get_mut(key) {
            Some(hash) => hash.remove(field).is_some(),
            None => false,
        };
        if state.hashes.get(key).is_some_and(HashMap::is_empty) {
            state.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hget_all(&self, key: &str) -> JobResult<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn scan_prefix(&self, prefix: &str) -> JobResult<Vec<String>> {
        let mut state = self.state.lock();
        let candidates: Vec<String> = state
            .strings
            .keys()
            .chain(state.zsets.keys())
            .chain(state.hashes.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        let mut keys = Vec::with_capacity(candidates.len());
        for key in candidates {
            state.purge(&key);
            if state.exists(&key) {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn acquire_highest_capacity(&self, key: &str) -> JobResult<Option<String>> {
        let mut state = self.state.lock();
        let Some(set) = state.zset(key) else {
            return Ok(None);
        };
        match set.max() {
            Some((member, score)) if score > 0.0 => {
                set.insert(&member, score - 1.0);
                Ok(Some(member))
            }
            _ => Ok(None),
        }
    }

    async fn release_capacity(&self, key: &str, member: &str, cap: f64) -> JobResult<Option<f64>> {
        let mut state = self.state.lock();
        let Some(set) = state.zset(key) else {
            return Ok(None);
        };
        let Some(score) = set.score(member) else {
            return Ok(None);
        };
        if score >= cap {
            return Ok(Some(score));
        }
        set.insert(member, score + 1.0);
        Ok(Some(score + 1.0))
    }

    async fn incr_with_expiry(&self, key: &str, delta: i64, ttl: Duration) -> JobResult<i64> {
        let mut state = self.state.lock();
        let next = state.incr(key, delta)?;
        if !state.expiries.contains_key(key) {
            state.set_expiry(key, Some(ttl));
        }
        Ok(next)
    }

    async fn hset_and_zadd(
        &self,
        hash_key: &str,
        zset_key: &str,
        member: &str,
        value: &str,
        score: f64,
    ) -> JobResult<()> {
        let mut state = self.state.lock();
        state.purge(hash_key);
        state
            .hashes
            .entry(hash_key.to_string())
            .or_default()
            .insert(member.to_string(), value.to_string());
        state.zset_or_default(zset_key).insert(member, score);
        Ok(())
    }

    async fn hdel_and_zrem(&self, hash_key: &str, zset_key: &str, member: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        state.purge(hash_key);
        if let Some(hash) = state.hashes.get_mut(hash_key) {
            hash.remove(member);
        }
        if state.hashes.get(hash_key).is_some_and(HashMap::is_empty) {
            state.hashes.remove(hash_key);
        }
        let removed = state
            .zset(zset_key)
            .and_then(|set| set.remove(member))
            .is_some();
        state.drop_if_empty(zset_key);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "a", None).await.unwrap());
        assert!(!store.set_nx("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire_lazily() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        assert!(store.ttl("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx("k", "w", None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_restarts_after_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("c", 1).await.unwrap(), 1);
        store.expire("c", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.incr_by("c", 1).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.incr_by("c", 1).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_with_expiry_arms_missing_ttl_only() {
        let store = MemoryStore::new();
        store.incr_by("c", 1).await.unwrap();
        assert_eq!(store.ttl("c").await.unwrap(), None);

        assert_eq!(store.incr_with_expiry("c", 1, Duration::from_secs(10)).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(4)).await;
        store.incr_with_expiry("c", 1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.ttl("c").await.unwrap(), Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(store.incr_with_expiry("c", 1, Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hash_and_set_move_together() {
        let store = MemoryStore::new();
        store.hset_and_zadd("info", "cap", "w1", "{}", 2.0).await.unwrap();
        assert_eq!(store.hget("info", "w1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(store.zscore("cap", "w1").await.unwrap(), Some(2.0));

        assert!(store.hdel_and_zrem("info", "cap", "w1").await.unwrap());
        assert_eq!(store.hget("info", "w1").await.unwrap(), None);
        assert_eq!(store.zscore("cap", "w1").await.unwrap(), None);
        assert!(!store.hdel_and_zrem("info", "cap", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_on_text_is_backend_error() {
        let store = MemoryStore::new();
        store.set("k", "text", None).await.unwrap();
        assert!(matches!(store.incr_by("k", 1).await, Err(JobError::Backend(_))));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.set("lock", "token-a", None).await.unwrap();
        assert!(!store.compare_and_delete("lock", "token-b").await.unwrap());
        assert!(store.compare_and_delete("lock", "token-a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sorted_set_ordering() {
        let store = MemoryStore::new();
        store.zadd("z", "c", 3.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "a", 4.0).await.unwrap();

        let range = store.zrange_by_score("z", 0.0, 3.0, 10).await.unwrap();
        assert_eq!(range, vec![("b".to_string(), 2.0), ("c".to_string(), 3.0)]);

        assert_eq!(store.zpop_min("z").await.unwrap(), Some(("b".to_string(), 2.0)));
        assert_eq!(store.zcard("z").await.unwrap(), 2);
        assert_eq!(store.zincr_by("z", "c", -1.5).await.unwrap(), 1.5);
        assert!(store.zrem("z", "c").await.unwrap());
        assert!(!store.zrem("z", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_highest_capacity() {
        let store = MemoryStore::new();
        store.zadd("cap", "w1", 1.0).await.unwrap();
        store.zadd("cap", "w2", 2.0).await.unwrap();

        assert_eq!(store.acquire_highest_capacity("cap").await.unwrap().as_deref(), Some("w2"));
        assert_eq!(store.zscore("cap", "w2").await.unwrap(), Some(1.0));
        store.acquire_highest_capacity("cap").await.unwrap();
        store.acquire_highest_capacity("cap").await.unwrap();
        assert_eq!(store.acquire_highest_capacity("cap").await.unwrap(), None);
        assert_eq!(store.zscore("cap", "w1").await.unwrap(), Some(0.0));
        assert_eq!(store.zscore("cap", "w2").await.unwrap(), Some(0.0));
    }

    #[tokio::test]
    async fn test_release_capacity_respects_cap_and_membership() {
        let store = MemoryStore::new();
        store.zadd("cap", "w1", 1.0).await.unwrap();

        assert_eq!(store.release_capacity("cap", "w1", 2.0).await.unwrap(), Some(2.0));
        assert_eq!(store.release_capacity("cap", "w1", 2.0).await.unwrap(), Some(2.0));
        assert_eq!(store.release_capacity("cap", "gone", 2.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert!(store.hdel("h", "a").await.unwrap());
        assert_eq!(store.hget_all("h").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let store = MemoryStore::new();
        store.set("p:job:1", "x", None).await.unwrap();
        store.set("p:job:2", "x", None).await.unwrap();
        store.zadd("p:queue:a", "1", 1.0).await.unwrap();

        let keys = store.scan_prefix("p:job:").await.unwrap();
        assert_eq!(keys, vec!["p:job:1".to_string(), "p:job:2".to_string()]);
    }
}
