//! ABOUTME: Schedule evaluation for one-time, interval, and cron jobs
//! ABOUTME: Normalizes 5-field cron expressions and computes next occurrences per timezone

use crate::types::{Job, JobKind, NewJob};
use ch_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Parse a standard 5-field cron expression.
///
/// The evaluator wants a seconds field, so `*/5 * * * *` becomes
/// `0 */5 * * * *` before parsing. Expressions with any other field count
/// are rejected rather than guessed at.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::Validation(format!(
            "Cron expression '{}' must have exactly 5 fields",
            expr
        )));
    }
    let with_seconds = format!("0 {}", fields.join(" "));
    Schedule::from_str(&with_seconds)
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// Resolve an IANA timezone name
pub fn validate_timezone(tz: &str) -> Result<chrono_tz::Tz> {
    tz.parse::<chrono_tz::Tz>()
        .map_err(|_| Error::Validation(format!("Unknown timezone: {}", tz)))
}

/// Next cron occurrence strictly after `after`, evaluated in the given timezone
pub fn next_cron_occurrence(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(expr)?;
    let tz = validate_timezone(timezone)?;
    let reference = after.with_timezone(&tz);
    Ok(schedule
        .after(&reference)
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

/// The first run time for a freshly created job, honoring the start bound.
///
/// Interval jobs fire immediately (their cadence is anchored at completion
/// time thereafter); cron jobs fire at the first occurrence after the
/// reference point. Returns None when no occurrence fits before `end_time`.
pub fn initial_run(new_job: &NewJob, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let reference = match new_job.start_time {
        Some(start) if start > now => start,
        _ => now,
    };

    let next = match new_job.kind {
        JobKind::OneTime => new_job.schedule_time,
        JobKind::Recurring => {
            if let Some(expr) = &new_job.cron_expression {
                next_cron_occurrence(expr, &new_job.timezone, reference)?
            } else {
                Some(reference)
            }
        }
    };

    Ok(clamp_to_end(next, new_job.end_time))
}

/// The next occurrence for a recurring job that just completed successfully.
///
/// Interval jobs advance from the completion time; cron jobs advance to the
/// next matching moment in the job's timezone. Returns None when the job has
/// no further occurrence (past `end_time`, or not recurring at all).
pub fn next_run(job: &Job, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if job.kind != JobKind::Recurring {
        return Ok(None);
    }

    let next = if let Some(expr) = &job.cron_expression {
        next_cron_occurrence(expr, &job.timezone, now)?
    } else if let Some(interval) = job.interval_ms {
        Some(now + Duration::milliseconds(interval))
    } else {
        None
    };

    Ok(clamp_to_end(next, job.end_time))
}

fn clamp_to_end(
    next: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (next, end_time) {
        (Some(n), Some(end)) if n > end => None,
        (n, _) => n,
    }
}
