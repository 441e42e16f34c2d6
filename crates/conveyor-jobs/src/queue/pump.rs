//! Maintenance pump: moves due delayed jobs and schedule fires into the
//! active queues, recovers stalled parked jobs and hands dispatches that
//! never reported back to the queue.

use super::{millis, JobFinished, QueueManager};
use crate::error::JobResult;
use crate::job::{JobId, JobRecord, JobState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a pump pass moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpReport {
    /// Delayed jobs made visible or parked.
    pub delayed: usize,
    /// Repeating schedule instances fired.
    pub fired: usize,
    /// Parked jobs promoted.
    pub promoted: usize,
    /// Stalled dispatches handed back to the queue.
    pub recovered: usize,
}

impl PumpReport {
    /// True when the pass moved nothing.
    pub fn is_idle(&self) -> bool {
        self.delayed == 0 && self.fired == 0 && self.promoted == 0 && self.recovered == 0
    }
}

impl QueueManager {
    /// Runs one maintenance pass at `now`.
    pub async fn pump(&self, now: DateTime<Utc>) -> JobResult<PumpReport> {
        let report = PumpReport {
            delayed: self.pump_delayed(now).await?,
            fired: self.pump_schedules(now).await?,
            promoted: self.promote_stalled().await?,
            recovered: self.recover_stalled(now).await?,
        };

        if !report.is_idle() {
            debug!(
                delayed = report.delayed,
                fired = report.fired,
                promoted = report.promoted,
                recovered = report.recovered,
                "Pump pass"
            );
        }
        Ok(report)
    }

    /// Admits delayed jobs whose visibility time has passed.
    pub async fn pump_delayed(&self, now: DateTime<Utc>) -> JobResult<usize> {
        let delayed_key = self.keys.delayed();
        let due = self
            .store
            .zrange_by_score(&delayed_key, f64::NEG_INFINITY, millis(now), self.pump_batch_size)
            .await?;

        let mut moved = 0;
        for (id, _) in due {
            if !self.store.zrem(&delayed_key, &id).await? {
                continue;
            }
            let job_id = JobId::from(id);
            let Some(record) = self.load(&job_id).await? else {
                warn!(job_id = %job_id, "Delayed job has no record, dropping");
                continue;
            };
            self.admit(record).await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Fires repeating schedules whose next fire time has passed.
    ///
    /// Each fire gets a deterministic instance id, so two dispatchers racing on
    /// the same schedule enqueue one instance. Fires missed while no pump ran
    /// are skipped, not replayed.
    pub async fn pump_schedules(&self, now: DateTime<Utc>) -> JobResult<usize> {
        let schedules_key = self.keys.schedules();
        let due = self
            .store
            .zrange_by_score(&schedules_key, f64::NEG_INFINITY, millis(now), self.pump_batch_size)
            .await?;

        let mut fired = 0;
        for (id, score) in due {
            let schedule_id = JobId::from(id);
            let Some(entry) = self.load(&schedule_id).await? else {
                warn!(job_id = %schedule_id, "Schedule has no record, dropping");
                self.store.zrem(&schedules_key, schedule_id.as_str()).await?;
                continue;
            };
            let Some(schedule) = entry.schedule.clone().filter(|_| entry.state == JobState::Scheduled) else {
                warn!(job_id = %schedule_id, state = %entry.state, "Schedule entry is not a schedule, dropping");
                self.store.zrem(&schedules_key, schedule_id.as_str()).await?;
                continue;
            };

            let fire_at = DateTime::from_timestamp_millis(score as i64).unwrap_or(now);
            if self.fire(&entry, fire_at, now).await? {
                fired += 1;
            }

            let next = match schedule.next_after(fire_at)? {
                Some(next) if next <= now => schedule.next_after(now)?,
                other => other,
            };
            match next {
                Some(next) => {
                    self.store
                        .zadd(&schedules_key, schedule_id.as_str(), millis(next))
                        .await?;
                }
                None => {
                    info!(job_id = %schedule_id, "Schedule has no further fire times");
                    self.store.zrem(&schedules_key, schedule_id.as_str()).await?;
                }
            }
        }
        Ok(fired)
    }

    async fn fire(&self, entry: &JobRecord, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> JobResult<bool> {
        let instance = entry.fire_instance(fire_at, now);
        let key = self.keys.job(&instance.id);
        if !self.store.set_nx(&key, &instance.to_json()?, None).await? {
            debug!(job_id = %instance.id, "Schedule fire already enqueued");
            return Ok(false);
        }

        debug!(job_id = %instance.id, schedule_id = %entry.id, fire_at = %fire_at, "Fired schedule");
        self.admit(instance).await?;
        Ok(true)
    }

    /// Promotes parked jobs for every tenant and class with a free admission unit.
    pub async fn promote_stalled(&self) -> JobResult<usize> {
        let mut promoted = 0;
        for (tenant_id, class) in self.admission.parked_groups().await? {
            while self.promote(&tenant_id, class).await?.is_some() {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Re-admits dispatched jobs whose completion report is overdue at `now`.
    ///
    /// A dispatch is overdue once it is older than the stall timeout. It goes
    /// through the completion path as abandoned: the slot and the admission
    /// unit are given back and the job is queued again without using an
    /// attempt. An index entry whose record was never marked dispatched is
    /// put back into its active queue.
    pub async fn recover_stalled(&self, now: DateTime<Utc>) -> JobResult<usize> {
        let Some(cutoff) = ChronoDuration::from_std(self.stall_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Ok(0);
        };

        let dispatched_key = self.keys.dispatched();
        let overdue = self
            .store
            .zrange_by_score(&dispatched_key, f64::NEG_INFINITY, millis(cutoff), self.pump_batch_size)
            .await?;

        let mut recovered = 0;
        for (id, _) in overdue {
            let job_id = JobId::from(id);
            let Some(record) = self.load(&job_id).await? else {
                self.store.zrem(&dispatched_key, job_id.as_str()).await?;
                continue;
            };

            match (record.state, record.worker_id.clone()) {
                (JobState::Dispatched, Some(worker_id)) => {
                    warn!(
                        job_id = %job_id,
                        worker_id = %worker_id,
                        dispatched_at = ?record.dispatched_at,
                        "Dispatched job never reported back, recovering"
                    );
                    if self.settle(JobFinished::abandoned(job_id, worker_id)).await? {
                        recovered += 1;
                    }
                }
                (JobState::Queued, _) => {
                    if self.store.zrem(&dispatched_key, job_id.as_str()).await? {
                        warn!(job_id = %job_id, "Dequeued job was never dispatched, requeueing");
                        self.activate(record, now).await?;
                        recovered += 1;
                    }
                }
                _ => {
                    self.store.zrem(&dispatched_key, job_id.as_str()).await?;
                }
            }
        }
        Ok(recovered)
    }
}
