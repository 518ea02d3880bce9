// Triggers known to the node-local scheduler engine

use crate::errors::ScheduleError;
use crate::schedule::{next_cron_fire_time, parse_cron_expression, parse_timezone};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

/// Epoch + 1000 years: 2970-01-01T00:00:00Z
const FAR_FUTURE_SECONDS: i64 = 365_243 * 86_400;

/// Placeholder fire time for triggers that must never fire on their own
pub fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(FAR_FUTURE_SECONDS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
pub trait Trigger: Send + Sync {
    /// Job this trigger launches
    fn job_name(&self) -> &str;

    fn cron_expression(&self) -> Option<&str> {
        None
    }

    /// First autonomous fire time, computed when the trigger is scheduled
    fn compute_first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Next autonomous fire time strictly after `after`
    fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Next fire time as shown to monitoring tools
    async fn next_fire_time(&self) -> Option<DateTime<Utc>>;
}

/// Wall-clock trigger driven by a seconds-precision cron expression
#[derive(Debug, Clone)]
pub struct CronTrigger {
    job_name: String,
    expression: String,
    schedule: CronSchedule,
    timezone: Tz,
}

impl CronTrigger {
    pub fn new(
        job_name: impl Into<String>,
        expression: &str,
        timezone: Option<&str>,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            job_name: job_name.into(),
            expression: expression.to_string(),
            schedule: parse_cron_expression(expression)?,
            timezone: parse_timezone(timezone)?,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

#[async_trait]
impl Trigger for CronTrigger {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn cron_expression(&self) -> Option<&str> {
        Some(&self.expression)
    }

    fn compute_first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.fire_time_after(now)
    }

    fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_cron_fire_time(&self.schedule, self.timezone, after)
    }

    async fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.fire_time_after(Utc::now())
    }
}
