//! Redis-backed coordination store.

use super::CoordinationStore;
use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Read the highest-scored worker, verify it has a free slot, take one.
const ACQUIRE_CAPACITY_SCRIPT: &str = r#"
local top = redis.call('ZREVRANGEBYSCORE', KEYS[1], '+inf', '-inf', 'WITHSCORES', 'LIMIT', 0, 1)
if #top == 0 then
    return false
end
if tonumber(top[2]) <= 0 then
    return false
end
redis.call('ZINCRBY', KEYS[1], -1, top[1])
return top[1]
"#;

/// Give a slot back unless the worker is gone or already full.
const RELEASE_CAPACITY_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
    return false
end
if tonumber(score) >= tonumber(ARGV[2]) then
    return score
end
return redis.call('ZINCRBY', KEYS[1], 1, ARGV[1])
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Count a hit, arming the expiry only on a key that has none.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

const HSET_AND_ZADD_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

const HDEL_AND_ZREM_SCRIPT: &str = r#"
redis.call('HDEL', KEYS[1], ARGV[1])
return redis.call('ZREM', KEYS[2], ARGV[1])
"#;

/// Create a Redis connection pool and check it with a PING.
pub async fn create_pool(url: &str, config: &RedisConfig) -> JobResult<Pool> {
    info!(url = %url, "Creating Redis connection pool for coordination store...");

    let cfg = Config::from_url(url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .create_timeout(Some(Duration::from_secs(config.connect_timeout_secs)))
        .wait_timeout(Some(Duration::from_secs(config.connect_timeout_secs)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Coordination store over a deadpool-redis pool.
///
/// Multi-step atomic operations run as Lua scripts, so they stay atomic
/// across every process sharing the Redis instance.
pub struct RedisStore {
    pool: Pool,
    acquire_script: Script,
    release_script: Script,
    compare_delete_script: Script,
    compare_expire_script: Script,
    incr_expiry_script: Script,
    register_script: Script,
    unregister_script: Script,
}

impl RedisStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            acquire_script: Script::new(ACQUIRE_CAPACITY_SCRIPT),
            release_script: Script::new(RELEASE_CAPACITY_SCRIPT),
            compare_delete_script: Script::new(COMPARE_AND_DELETE_SCRIPT),
            compare_expire_script: Script::new(COMPARE_AND_EXPIRE_SCRIPT),
            incr_expiry_script: Script::new(INCR_WITH_EXPIRY_SCRIPT),
            register_script: Script::new(HSET_AND_ZADD_SCRIPT),
            unregister_script: Script::new(HDEL_AND_ZREM_SCRIPT),
        }
    }

    /// Connects to `url` and creates a store.
    pub async fn connect(url: &str, config: &RedisConfig) -> JobResult<Self> {
        Ok(Self::new(create_pool(url, config).await?))
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let result: Option<String> = cmd.query_async(&mut *conn).await?;
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .compare_delete_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await?;
        Ok(removed == 1)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = self
            .compare_expire_script
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut *conn)
            .await?;
        Ok(updated == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> JobResult<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.incr(key, delta).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.pexpire(key, millis(ttl) as i64).await?)
    }

    async fn ttl(&self, key: &str) -> JobResult<Option<Duration>> {
        let mut conn = self.conn().await?;
        let ttl: i64 = conn.pttl(key).await?;
        Ok((ttl >= 0).then(|| Duration::from_millis(ttl as u64)))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> JobResult<f64> {
        let mut conn = self.conn().await?;
        Ok(conn.zincr(key, member, delta).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> JobResult<Option<f64>> {
        let mut conn = self.conn().await?;
        Ok(conn.zscore(key, member).await?)
    }

    async fn zpop_min(&self, key: &str) -> JobResult<Option<(String, f64)>> {
        let mut conn = self.conn().await?;
        let result: Vec<(String, f64)> = conn.zpopmin(key, 1).await?;
        Ok(result.into_iter().next())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> JobResult<Vec<(String, f64)>> {
        let mut conn = self.conn().await?;
        Ok(conn
            .zrangebyscore_limit_withscores(key, min, max, 0, limit as isize)
            .await?)
    }

    async fn zcard(&self, key: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(key).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hget(key, field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hget_all(&self, key: &str) -> JobResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn scan_prefix(&self, prefix: &str) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;

            keys.extend(batch);

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn acquire_highest_capacity(&self, key: &str) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(self.acquire_script.key(key).invoke_async(&mut *conn).await?)
    }

    async fn release_capacity(&self, key: &str, member: &str, cap: f64) -> JobResult<Option<f64>> {
        let mut conn = self.conn().await?;
        let score: Option<String> = self
            .release_script
            .key(key)
            .arg(member)
            .arg(cap)
            .invoke_async(&mut *conn)
            .await?;

        score
            .map(|s| {
                s.parse::<f64>()
                    .map_err(|e| JobError::Backend(format!("invalid capacity score {}: {}", s, e)))
            })
            .transpose()
    }

    async fn incr_with_expiry(&self, key: &str, delta: i64, ttl: Duration) -> JobResult<i64> {
        let mut conn = self.conn().await?;
        Ok(self
            .incr_expiry_script
            .key(key)
            .arg(delta)
            .arg(millis(ttl))
            .invoke_async(&mut *conn)
            .await?)
    }

    async fn hset_and_zadd(
        &self,
        hash_key: &str,
        zset_key: &str,
        member: &str,
        value: &str,
        score: f64,
    ) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .register_script
            .key(hash_key)
            .key(zset_key)
            .arg(member)
            .arg(value)
            .arg(score)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn hdel_and_zrem(&self, hash_key: &str, zset_key: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .unregister_script
            .key(hash_key)
            .key(zset_key)
            .arg(member)
            .invoke_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }
}
