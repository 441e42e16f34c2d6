//! Duplicate event suppression.

use crate::config::DedupConfig;
use crate::error::JobResult;
use crate::keys::StoreKeys;
use crate::metrics::DedupMetrics;
use crate::store::CoordinationStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Drops repeat deliveries of the same external event within a window.
///
/// The token is read from each payload at a JSON pointer. A hit counter keyed
/// by `(owner, token)` is incremented atomically and gets its expiry in the
/// same step when it has none, so concurrent repeats cannot stretch the
/// window and a counter never outlives it. Payloads without a token always
/// pass.
pub struct Deduplicator {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    ttl: Duration,
    token_pointer: String,
}

impl Deduplicator {
    /// Creates a deduplicator.
    pub fn new(store: Arc<dyn CoordinationStore>, keys: StoreKeys, config: &DedupConfig) -> Self {
        Self {
            store,
            keys,
            ttl: config.ttl(),
            token_pointer: config.token_pointer.clone(),
        }
    }

    /// Dedup window.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the payloads that are not duplicates, in input order.
    pub async fn filter(&self, owner_id: &str, payloads: Vec<Value>) -> JobResult<Vec<Value>> {
        let mut kept = Vec::with_capacity(payloads.len());
        let mut suppressed = 0u64;

        for payload in payloads {
            let Some(token) = self.token(&payload) else {
                kept.push(payload);
                continue;
            };

            let key = self.keys.dedup(owner_id, &token);
            let hits = self.store.incr_with_expiry(&key, 1, self.ttl).await?;
            if hits == 1 {
                kept.push(payload);
            } else {
                debug!(owner_id = %owner_id, token = %token, hits, "Dropped duplicate payload");
                suppressed += 1;
            }
        }

        DedupMetrics::suppressed(suppressed);
        Ok(kept)
    }

    fn token(&self, payload: &Value) -> Option<String> {
        match payload.pointer(&self.token_pointer)? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
