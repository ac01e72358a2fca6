//! Cadence-to-next-run computation.
//!
//! Pure and deterministic: (cadence, schedule, now) → next run instant or
//! None. The caller supplies `now`, so the whole module is testable with
//! fixed clocks. No I/O, no side effects.
//!
//! Cron support is deliberately minimal (`*/N * * * *`, `0 * * * *`,
//! `0 0 * * *`); anything else falls back to the interval default.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use scanloop_core::model::{AutomationTask, Cadence, ScheduleConfig};

/// Minimum interval cadence, guards against runaway polling.
const MIN_INTERVAL_MINUTES: i64 = 5;
const DEFAULT_INTERVAL_MINUTES: i64 = 60;

/// Compute the next run instant for a cadence, or None for manual tasks.
pub fn next_run_at(
    cadence: Cadence,
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match cadence {
        Cadence::Manual => None,
        Cadence::Interval => {
            let minutes = schedule
                .interval_minutes
                .unwrap_or(DEFAULT_INTERVAL_MINUTES)
                .max(MIN_INTERVAL_MINUTES);
            Some(now + Duration::minutes(minutes))
        }
        Cadence::Hourly => Some(now + Duration::minutes(60)),
        Cadence::Daily => Some(next_daily(schedule, now)),
        Cadence::Cron => Some(next_cron(schedule, now)),
    }
}

/// The task's schedule with the task-level timezone filled in when the
/// schedule itself carries no override.
pub fn effective_schedule(task: &AutomationTask) -> ScheduleConfig {
    let mut schedule = task.schedule.clone();
    if schedule.timezone.is_none() && !task.timezone.is_empty() {
        schedule.timezone = Some(task.timezone.clone());
    }
    schedule
}

/// Next occurrence of the configured wall-clock time in the configured zone.
/// Rolls to the next calendar day when today's occurrence has passed.
fn next_daily(schedule: &ScheduleConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let (hour, minute) = parse_daily_time(schedule.daily_time.as_deref().unwrap_or("00:00"));
    let tz: Tz = schedule
        .timezone
        .as_deref()
        .unwrap_or("UTC")
        .parse()
        .unwrap_or(chrono_tz::UTC);

    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();

    let candidate = resolve_wall_clock(tz, today, hour, minute);
    if candidate > now {
        candidate
    } else {
        resolve_wall_clock(tz, today + Duration::days(1), hour, minute)
    }
}

/// Resolve a wall-clock time on a calendar day to a UTC instant. A time that
/// does not exist in the zone (spring-forward gap) shifts one hour later.
fn resolve_wall_clock(tz: Tz, day: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let naive: NaiveDateTime = day
        .and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| day.and_time(chrono::NaiveTime::MIN));
    match tz.from_local_datetime(&naive).earliest() {
        Some(instant) => instant.with_timezone(&Utc),
        None => {
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|i| i.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        }
    }
}

/// Parse "HH:MM"; malformed input degrades to midnight.
fn parse_daily_time(value: &str) -> (u32, u32) {
    let mut parts = value.split(':');
    let hour = parts
        .next()
        .and_then(|h| h.trim().parse::<u32>().ok())
        .filter(|h| *h < 24)
        .unwrap_or(0);
    let minute = parts
        .next()
        .and_then(|m| m.trim().parse::<u32>().ok())
        .filter(|m| *m < 60)
        .unwrap_or(0);
    (hour, minute)
}

/// Minimal cron matcher. Full cron grammar is out of scope; unrecognized
/// expressions fall back to the interval default.
fn next_cron(schedule: &ScheduleConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let fallback_minutes = schedule
        .interval_minutes
        .unwrap_or(DEFAULT_INTERVAL_MINUTES);

    let Some(expr) = schedule.cron.as_deref().map(str::trim) else {
        return now + Duration::minutes(fallback_minutes);
    };

    if expr == "0 * * * *" {
        return now + Duration::minutes(60);
    }
    if expr == "0 0 * * *" {
        return now + Duration::hours(24);
    }
    if let Some(step) = parse_minute_step(expr) {
        return now + Duration::minutes(step.max(1));
    }

    now + Duration::minutes(fallback_minutes)
}

/// Match `*/N * * * *` and return N.
fn parse_minute_step(expr: &str) -> Option<i64> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 || !fields[1..].iter().all(|f| *f == "*") {
        return None;
    }
    fields[0].strip_prefix("*/")?.parse().ok()
}
