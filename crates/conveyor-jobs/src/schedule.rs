//! Cron schedules for repeating jobs.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A cron expression evaluated in a timezone.
///
/// Five-field expressions (minute resolution) get a leading `0` seconds
/// field; six and seven field expressions are taken as-is. The timezone is
/// `UTC`, `Z` or a fixed offset such as `+05:30`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// Expression as given by the producer.
    pub expression: String,
    /// Timezone as given by the producer.
    pub timezone: String,
}

impl CronSchedule {
    /// Validates and builds a schedule.
    pub fn new(expression: impl Into<String>, timezone: impl Into<String>) -> JobResult<Self> {
        let schedule = Self {
            expression: expression.into(),
            timezone: timezone.into(),
        };
        schedule.parse()?;
        schedule.offset()?;
        Ok(schedule)
    }

    /// First fire time strictly after `after`.
    ///
    /// `None` when the expression has no future occurrence.
    pub fn next_after(&self, after: DateTime<Utc>) -> JobResult<Option<DateTime<Utc>>> {
        let schedule = self.parse()?;
        let local = after.with_timezone(&self.offset()?);
        Ok(schedule.after(&local).next().map(|dt| dt.with_timezone(&Utc)))
    }

    fn parse(&self) -> JobResult<Schedule> {
        let expression = self.expression.trim();
        let normalized = match expression.split_whitespace().count() {
            5 => format!("0 {}", expression),
            6 | 7 => expression.to_string(),
            n => {
                return Err(JobError::InvalidSchedule(format!(
                    "{}: expected 5 to 7 fields, got {}",
                    self.expression, n
                )))
            }
        };

        Schedule::from_str(&normalized)
            .map_err(|e| JobError::InvalidSchedule(format!("{}: {}", self.expression, e)))
    }

    fn offset(&self) -> JobResult<FixedOffset> {
        parse_offset(&self.timezone)
            .ok_or_else(|| JobError::InvalidSchedule(format!("unknown timezone: {}", self.timezone)))
    }
}

fn parse_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    match tz {
        "" | "UTC" | "utc" | "Z" | "Etc/UTC" | "GMT" => return FixedOffset::east_opt(0),
        _ => {}
    }

    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => (rest.get(..2)?, rest.get(2..)?),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Common cron expressions.
pub mod cron_expressions {
    /// Every minute.
    pub const EVERY_MINUTE: &str = "* * * * *";
    /// Every 5 minutes.
    pub const EVERY_5_MINUTES: &str = "*/5 * * * *";
    /// Every hour at minute 0.
    pub const HOURLY: &str = "0 * * * *";
    /// Every day at midnight.
    pub const DAILY: &str = "0 0 * * *";
}
