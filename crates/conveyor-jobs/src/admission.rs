//! Per-tenant admission control.
//!
//! Each `(tenant, class)` pair has an in-flight counter in the coordination
//! store. A job that would push the counter over its ceiling is parked in the
//! overflow set of that pair instead of the active queue. Parking is flow
//! control, not an error: the job is promoted back, oldest first, when a job
//! of the same tenant and class finishes.

use crate::config::AdmissionConfig;
use crate::error::JobResult;
use crate::job::{JobClass, JobId, JobRecord, JobState};
use crate::keys::StoreKeys;
use crate::metrics::JobMetrics;
use crate::store::CoordinationStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counts in-flight jobs and manages the parked sets.
pub struct AdmissionController {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    config: AdmissionConfig,
}

impl AdmissionController {
    /// Creates a controller.
    pub fn new(store: Arc<dyn CoordinationStore>, keys: StoreKeys, config: AdmissionConfig) -> Self {
        Self { store, keys, config }
    }

    /// Ceiling for a tenant and class.
    pub fn ceiling(&self, class: JobClass, tenant_id: &str) -> u32 {
        self.config.ceiling_for(class, tenant_id)
    }

    /// Counts one more in-flight job and reports whether it is over the ceiling.
    ///
    /// When limited the count is given back, so a parked job does not hold a
    /// unit of the ceiling.
    pub async fn should_limit(&self, class: JobClass, tenant_id: &str) -> JobResult<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        let key = self.keys.admission(tenant_id, class);
        let ceiling = i64::from(self.ceiling(class, tenant_id));
        let count = self.store.incr_by(&key, 1).await?;

        if count > ceiling {
            self.store.incr_by(&key, -1).await?;
            debug!(tenant_id = %tenant_id, class = %class, count, ceiling, "Admission limited");
            return Ok(true);
        }

        Ok(false)
    }

    /// Adjusts the in-flight count; `delta` is negative when jobs finish.
    ///
    /// A count driven below zero by a race is pulled back to zero with a
    /// compensating increment.
    pub async fn change_count(&self, class: JobClass, tenant_id: &str, delta: i64) -> JobResult<i64> {
        if !self.config.enabled || delta == 0 {
            return Ok(0);
        }

        let key = self.keys.admission(tenant_id, class);
        let count = self.store.incr_by(&key, delta).await?;
        if count < 0 {
            warn!(tenant_id = %tenant_id, class = %class, count, "In-flight count went negative, correcting");
            self.store.incr_by(&key, -count).await?;
            return Ok(0);
        }

        Ok(count)
    }

    /// Current in-flight count.
    pub async fn in_flight(&self, class: JobClass, tenant_id: &str) -> JobResult<i64> {
        let key = self.keys.admission(tenant_id, class);
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Holds a job in the overflow set of its tenant and class, behind every
    /// job parked before it.
    pub async fn park(&self, record: &JobRecord) -> JobResult<()> {
        let sequence = self.store.incr_by(&self.keys.park_sequence(), 1).await?;
        self.store
            .zadd(
                &self.keys.parked(&record.tenant_id, record.class),
                record.id.as_str(),
                sequence as f64,
            )
            .await?;
        self.store
            .zadd(
                &self.keys.parked_index(),
                &index_member(&record.tenant_id, record.class),
                0.0,
            )
            .await?;

        JobMetrics::job_parked(record.class);
        debug!(job_id = %record.id, tenant_id = %record.tenant_id, class = %record.class, sequence, "Parked job");
        Ok(())
    }

    /// Takes a job out of its overflow set. True for the caller that removed it.
    pub async fn unpark(&self, tenant_id: &str, class: JobClass, job_id: &JobId) -> JobResult<bool> {
        self.store
            .zrem(&self.keys.parked(tenant_id, class), job_id.as_str())
            .await
    }

    /// Parked jobs of a tenant and class, oldest first.
    pub async fn parked(&self, tenant_id: &str, class: JobClass, limit: usize) -> JobResult<Vec<JobId>> {
        Ok(self
            .store
            .zrange_by_score(&self.keys.parked(tenant_id, class), f64::MIN, f64::MAX, limit)
            .await?
            .into_iter()
            .map(|(id, _)| JobId::from(id))
            .collect())
    }

    /// Number of parked jobs of a tenant, across classes.
    pub async fn parked_count(&self, tenant_id: &str) -> JobResult<u64> {
        let mut count = 0;
        for class in JobClass::ALL {
            count += self.store.zcard(&self.keys.parked(tenant_id, class)).await?;
        }
        Ok(count)
    }

    /// Tenant and class pairs that may have parked jobs.
    ///
    /// Read from the parked index, so the cost follows the number of parked
    /// sets rather than the size of the keyspace. An entry can outlive its set
    /// briefly; [`promote`](Self::promote) drops it on the next empty pop.
    pub async fn parked_groups(&self) -> JobResult<Vec<(String, JobClass)>> {
        Ok(self
            .store
            .zrange_by_score(&self.keys.parked_index(), f64::NEG_INFINITY, f64::INFINITY, usize::MAX)
            .await?
            .into_iter()
            .filter_map(|(member, _)| {
                let (class, tenant_id) = member.split_once(':')?;
                Some((tenant_id.to_string(), class.parse().ok()?))
            })
            .collect())
    }

    /// Re-admits the oldest parked job of a tenant and class, if admission
    /// allows it.
    ///
    /// Returns the admitted record, already counted as in flight; the caller
    /// makes it visible. A job still over its ceiling goes back to the head of
    /// its overflow set. Other classes of the same tenant are never blocked by it.
    pub async fn promote(&self, tenant_id: &str, class: JobClass) -> JobResult<Option<JobRecord>> {
        let parked_key = self.keys.parked(tenant_id, class);

        loop {
            let Some((job_id, sequence)) = self.store.zpop_min(&parked_key).await? else {
                self.forget_if_empty(tenant_id, class).await?;
                return Ok(None);
            };
            let job_id = JobId::from(job_id);

            let Some(json) = self.store.get(&self.keys.job(&job_id)).await? else {
                warn!(job_id = %job_id, tenant_id = %tenant_id, "Parked job has no record, dropping");
                continue;
            };
            let record = JobRecord::from_json(&json)?;
            if record.state != JobState::Parked {
                debug!(job_id = %job_id, state = %record.state, "Skipping stale parked entry");
                continue;
            }

            if self.should_limit(record.class, tenant_id).await? {
                self.store.zadd(&parked_key, job_id.as_str(), sequence).await?;
                return Ok(None);
            }

            JobMetrics::job_promoted(record.class);
            debug!(job_id = %job_id, tenant_id = %tenant_id, class = %class, "Promoted parked job");
            return Ok(Some(record));
        }
    }

    /// Drops an index entry whose set is empty. A park racing this call either
    /// sees its index entry removed and re-added here, or adds it afterwards.
    async fn forget_if_empty(&self, tenant_id: &str, class: JobClass) -> JobResult<()> {
        let index = self.keys.parked_index();
        let member = index_member(tenant_id, class);
        if !self.store.zrem(&index, &member).await? {
            return Ok(());
        }
        if self.store.zcard(&self.keys.parked(tenant_id, class)).await? > 0 {
            self.store.zadd(&index, &member, 0.0).await?;
        }
        Ok(())
    }
}

fn index_member(tenant_id: &str, class: JobClass) -> String {
    format!("{}:{}", class.as_str(), tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn controller(ceiling: u32) -> (AdmissionController, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = AdmissionConfig {
            max_concurrent_per_tenant: ceiling,
            ..AdmissionConfig::default()
        };
        (
            AdmissionController::new(store.clone(), StoreKeys::new("t"), config),
            store,
        )
    }

    async fn parked_record(store: &MemoryStore, tenant: &str, id: &str) -> JobRecord {
        let mut record = JobSpec::one_time(tenant, json!({}))
            .id(id)
            .into_record(Utc::now(), 3)
            .unwrap();
        record.state = JobState::Parked;
        store
            .set(&StoreKeys::new("t").job(&record.id), &record.to_json().unwrap(), None)
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_limit_at_ceiling() {
        let (admission, _) = controller(2);
        assert!(!admission.should_limit(JobClass::OneTime, "acme").await.unwrap());
        assert!(!admission.should_limit(JobClass::OneTime, "acme").await.unwrap());
        assert!(admission.should_limit(JobClass::OneTime, "acme").await.unwrap());
        assert_eq!(admission.in_flight(JobClass::OneTime, "acme").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tenants_and_classes_are_independent() {
        let (admission, _) = controller(1);
        assert!(!admission.should_limit(JobClass::OneTime, "acme").await.unwrap());
        assert!(!admission.should_limit(JobClass::OneTime, "globex").await.unwrap());
        assert!(!admission.should_limit(JobClass::Webhook, "acme").await.unwrap());
        assert!(admission.should_limit(JobClass::OneTime, "acme").await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_never_limits() {
        let store = Arc::new(MemoryStore::new());
        let config = AdmissionConfig {
            enabled: false,
            max_concurrent_per_tenant: 1,
            ..AdmissionConfig::default()
        };
        let admission = AdmissionController::new(store, StoreKeys::new("t"), config);
        for _ in 0..5 {
            assert!(!admission.should_limit(JobClass::OneTime, "acme").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_change_count_clamps_at_zero() {
        let (admission, _) = controller(5);
        admission.should_limit(JobClass::OneTime, "acme").await.unwrap();
        assert_eq!(admission.change_count(JobClass::OneTime, "acme", -1).await.unwrap(), 0);
        assert_eq!(admission.change_count(JobClass::OneTime, "acme", -1).await.unwrap(), 0);
        assert_eq!(admission.in_flight(JobClass::OneTime, "acme").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_promote_is_fifo() {
        let (admission, store) = controller(1);
        admission.should_limit(JobClass::OneTime, "acme").await.unwrap();

        for id in ["first", "second", "third"] {
            let record = parked_record(&store, "acme", id).await;
            admission.park(&record).await.unwrap();
        }
        assert_eq!(admission.parked_count("acme").await.unwrap(), 3);

        // Still at the ceiling: nothing moves and the head stays in place.
        assert!(admission.promote("acme", JobClass::OneTime).await.unwrap().is_none());
        assert_eq!(
            admission.parked("acme", JobClass::OneTime, 1).await.unwrap(),
            vec![JobId::from("first")]
        );

        admission.change_count(JobClass::OneTime, "acme", -1).await.unwrap();
        let promoted = admission.promote("acme", JobClass::OneTime).await.unwrap().unwrap();
        assert_eq!(promoted.id.as_str(), "first");
        assert_eq!(admission.parked_count("acme").await.unwrap(), 2);
        assert_eq!(admission.in_flight(JobClass::OneTime, "acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_promote_skips_cancelled_entries() {
        let (admission, store) = controller(1);
        let gone = parked_record(&store, "acme", "gone").await;
        admission.park(&gone).await.unwrap();
        store.delete(&StoreKeys::new("t").job(&gone.id)).await.unwrap();
        let next = parked_record(&store, "acme", "next").await;
        admission.park(&next).await.unwrap();

        let promoted = admission.promote("acme", JobClass::OneTime).await.unwrap().unwrap();
        assert_eq!(promoted.id.as_str(), "next");
    }

    #[tokio::test]
    async fn test_limited_class_does_not_block_another() {
        let (admission, store) = controller(1);
        admission.should_limit(JobClass::OneTime, "acme").await.unwrap();
        admission.should_limit(JobClass::Webhook, "acme").await.unwrap();

        admission.park(&parked_record(&store, "acme", "b").await).await.unwrap();
        let mut hook = parked_record(&store, "acme", "w2").await;
        hook.class = JobClass::Webhook;
        store
            .set(&StoreKeys::new("t").job(&hook.id), &hook.to_json().unwrap(), None)
            .await
            .unwrap();
        admission.park(&hook).await.unwrap();

        admission.change_count(JobClass::Webhook, "acme", -1).await.unwrap();
        assert!(admission.promote("acme", JobClass::OneTime).await.unwrap().is_none());
        let promoted = admission.promote("acme", JobClass::Webhook).await.unwrap().unwrap();
        assert_eq!(promoted.id.as_str(), "w2");
        assert_eq!(admission.parked_count("acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_parked_groups_follow_the_index() {
        let (admission, store) = controller(1);
        admission.park(&parked_record(&store, "acme", "a").await).await.unwrap();
        admission.park(&parked_record(&store, "team:blue", "b").await).await.unwrap();

        let mut groups = admission.parked_groups().await.unwrap();
        groups.sort();
        assert_eq!(
            groups,
            vec![
                ("acme".to_string(), JobClass::OneTime),
                ("team:blue".to_string(), JobClass::OneTime),
            ]
        );

        admission.promote("acme", JobClass::OneTime).await.unwrap().unwrap();
        admission.change_count(JobClass::OneTime, "acme", -1).await.unwrap();
        assert!(admission.promote("acme", JobClass::OneTime).await.unwrap().is_none());
        assert_eq!(
            admission.parked_groups().await.unwrap(),
            vec![("team:blue".to_string(), JobClass::OneTime)]
        );
    }
}
