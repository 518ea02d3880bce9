// Schedule parsing and fire time calculation
//
// Cron expressions use second precision (6 or 7 fields) and are evaluated in
// the job's timezone; all results are returned in UTC.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an IANA timezone name, defaulting to UTC when absent
pub fn parse_timezone(name: Option<&str>) -> Result<Tz, ScheduleError> {
    match name {
        None => Ok(default_timezone()),
        Some(name) => {
            Tz::from_str(name.trim()).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
        }
    }
}

/// First fire time of `schedule` strictly after `after`, evaluated in `timezone`
pub fn next_cron_fire_time(
    schedule: &CronSchedule,
    timezone: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let reference_in_tz = after.with_timezone(&timezone);
    schedule
        .after(&reference_in_tz)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Default timezone for cron triggers
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}
