//! Coordination store abstraction.
//!
//! Every cross-process counter, set and lease lives behind
//! [`CoordinationStore`]. Each method is a single atomic operation against
//! the backend; components never read a value, decide, and write it back.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{create_pool, RedisStore};

use crate::error::JobResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Atomic operations the dispatch core needs from its backend.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Round-trip check.
    async fn ping(&self) -> JobResult<()>;

    /// Get a string value.
    async fn get(&self, key: &str) -> JobResult<Option<String>>;

    /// Set a string value, optionally expiring.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<()>;

    /// Set a string value only if the key is absent. Returns true when set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<bool>;

    /// Delete a key of any type. Returns true when it existed.
    async fn delete(&self, key: &str) -> JobResult<bool>;

    /// Delete a string key only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> JobResult<bool>;

    /// Reset the expiry of a string key only while it still holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> JobResult<bool>;

    /// Add `delta` to an integer counter, creating it at zero.
    async fn incr_by(&self, key: &str, delta: i64) -> JobResult<i64>;

    /// Set the expiry of an existing key. Returns false when absent.
    async fn expire(&self, key: &str, ttl: Duration) -> JobResult<bool>;

    /// Remaining time to live; `None` when absent or persistent.
    async fn ttl(&self, key: &str) -> JobResult<Option<Duration>>;

    /// Add or update a sorted set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> JobResult<()>;

    /// Add `delta` to a member's score, creating it at zero.
    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> JobResult<f64>;

    /// Remove a member. Returns true for the caller that removed it.
    async fn zrem(&self, key: &str, member: &str) -> JobResult<bool>;

    /// Score of a member.
    async fn zscore(&self, key: &str, member: &str) -> JobResult<Option<f64>>;

    /// Remove and return the lowest-scored member.
    async fn zpop_min(&self, key: &str) -> JobResult<Option<(String, f64)>>;

    /// Members with `min <= score <= max`, ascending, at most `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> JobResult<Vec<(String, f64)>>;

    /// Number of members.
    async fn zcard(&self, key: &str) -> JobResult<u64>;

    /// Set a hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> JobResult<()>;

    /// Get a hash field.
    async fn hget(&self, key: &str, field: &str) -> JobResult<Option<String>>;

    /// Delete a hash field. Returns true when it existed.
    async fn hdel(&self, key: &str, field: &str) -> JobResult<bool>;

    /// All fields of a hash.
    async fn hget_all(&self, key: &str) -> JobResult<HashMap<String, String>>;

    /// Every key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> JobResult<Vec<String>>;

    /// Pick the member with the highest score, and if that score is above
    /// zero decrement it by one and return the member. One atomic step.
    async fn acquire_highest_capacity(&self, key: &str) -> JobResult<Option<String>>;

    /// Increment a member's score by one unless it is no longer in the set or
    /// already at `cap`. Returns the new score, `None` when not a member.
    async fn release_capacity(&self, key: &str, member: &str, cap: f64) -> JobResult<Option<f64>>;

    /// Add `delta` to a counter and, if it carries no expiry, give it `ttl`.
    /// One atomic step. Returns the new value.
    async fn incr_with_expiry(&self, key: &str, delta: i64, ttl: Duration) -> JobResult<i64>;

    /// Set a hash field and a sorted set member together.
    async fn hset_and_zadd(
        &self,
        hash_key: &str,
        zset_key: &str,
        member: &str,
        value: &str,
        score: f64,
    ) -> JobResult<()>;

    /// Delete a hash field and a sorted set member together. Returns true
    /// when the sorted set member existed.
    async fn hdel_and_zrem(&self, hash_key: &str, zset_key: &str, member: &str) -> JobResult<bool>;
}
