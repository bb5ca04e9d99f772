//! Pure schedule-window evaluators.
//!
//! Stateless functions over cron expressions and allowed datetime ranges.
//! The cron dispatcher in the runtime crate decides *when* to fire; these
//! functions decide *whether* a given instant lies inside a rule's allowed
//! or currently running window. They are also what makes restart-during-
//! window recovery possible: a process that comes up mid-window can resume
//! immediately instead of idling until the next cron tick.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tracing::warn;

use crate::schema::{DatetimeRange, Rule};

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid datetime range: {0}")]
    InvalidRange(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
}

// ── Cron helpers ────────────────────────────────────────────────────

/// Normalize a 5-field cron expression to 6-field by prepending seconds.
///
/// The `cron` crate requires 6 fields: `sec min hour day-of-month month
/// day-of-week`. Rules use standard 5-field cron.
pub fn normalize_cron(cron_5field: &str) -> String {
    let trimmed = cron_5field.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parse a rule's cron expression into a [`Schedule`].
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

// ── Duration parsing ────────────────────────────────────────────────

/// Parse a compact duration string into a [`Duration`].
///
/// Supports components `Xd`, `Xh`, `Xm`, `Xs`, `Xms`, combinable as in
/// "2h30m" or "1m30s". A bare number is rejected; the unit is mandatory.
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ScheduleError::InvalidDuration(s.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut num = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                num.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let n: u64 = num
            .parse()
            .map_err(|_| ScheduleError::InvalidDuration(s.to_string()))?;
        let unit = match chars.next() {
            Some('d') => Duration::from_secs(86_400),
            Some('h') => Duration::from_secs(3_600),
            Some('s') => Duration::from_secs(1),
            Some('m') => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    Duration::from_millis(1)
                } else {
                    Duration::from_secs(60)
                }
            }
            _ => return Err(ScheduleError::InvalidDuration(s.to_string())),
        };
        total += unit * n as u32;
    }
    if total.is_zero() {
        return Err(ScheduleError::InvalidDuration(s.to_string()));
    }
    Ok(total)
}

// ── Window evaluators ───────────────────────────────────────────────

/// Whether `now` lies inside at least one `[begin, end)` window.
///
/// An empty range list means "always allowed".
pub fn is_in_schedule_ranges(
    now: DateTime<Utc>,
    ranges: &[DatetimeRange],
) -> Result<bool, ScheduleError> {
    if ranges.is_empty() {
        return Ok(true);
    }
    for range in ranges {
        let (begin, end) = range.resolve()?;
        if now >= begin && now < end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `now` is after the end of every range.
///
/// Distinguishes "schedule permanently terminated" from "waiting for the
/// next window". An unresolvable range counts as not-yet-terminated.
pub fn is_after_time_ranges(now: DateTime<Utc>, ranges: &[DatetimeRange]) -> bool {
    if ranges.is_empty() {
        return false;
    }
    for range in ranges {
        match range.resolve() {
            Ok((_, end)) if now > end => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(error = %e, "skipping unresolvable datetime range");
                return false;
            }
        }
    }
    true
}

/// Whether `now` falls inside the cron window that started at the most
/// recent fire time, i.e. a fire `f <= now` with `now < f + duration`.
///
/// Returns the remaining window time when inside. This is the crash and
/// restart reconciliation primitive: a process started just after a cron
/// fire resumes the window instead of waiting for the next tick.
pub fn is_in_running_schedule(
    cron_expr: &str,
    now: DateTime<Utc>,
    duration: Duration,
) -> Result<(bool, Duration), ScheduleError> {
    let schedule = parse_cron(cron_expr)?;
    let window = chrono::Duration::from_std(duration)
        .map_err(|_| ScheduleError::InvalidDuration(format!("{duration:?}")))?;

    // The only fires whose window can still contain `now` are those in
    // (now - duration, now]. Take the latest one.
    let mut last_fire = None;
    for fire in schedule.after(&(now - window)) {
        if fire > now {
            break;
        }
        last_fire = Some(fire);
    }
    match last_fire {
        Some(fire) => {
            let remaining = (fire + window - now).to_std().unwrap_or_default();
            Ok((true, remaining))
        }
        None => Ok((false, Duration::ZERO)),
    }
}

/// Next scheduled start for a cron rule as epoch millis, gated on the
/// allowed ranges. Returns 0 when the rule is not schedule-based, the
/// expression does not parse, or no upcoming fire falls inside a range.
pub fn next_schedule_start_ms(rule: &Rule, now: DateTime<Utc>) -> i64 {
    if !rule.is_schedule_rule() {
        return 0;
    }
    let schedule = match parse_cron(&rule.options.cron) {
        Ok(s) => s,
        Err(e) => {
            warn!(rule_id = %rule.id, error = %e, "cannot compute next start");
            return 0;
        }
    };
    // Bounded scan: enough fires to cross any realistic range gap.
    for fire in schedule.after(&now).take(100) {
        match is_in_schedule_ranges(fire, &rule.options.cron_datetime_range) {
            Ok(true) => return fire.timestamp_millis(),
            Ok(false) => continue,
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "cannot compute next start");
                return 0;
            }
        }
    }
    0
}

// ── Tests ───────────────────────────────────────────────────────────
