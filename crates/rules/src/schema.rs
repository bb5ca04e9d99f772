//! Rule definition schema.
//!
//! A rule is a continuous query plus sink actions, with lifecycle options
//! (triggered flag, cron expression, duration, allowed datetime ranges).
//! Rules are persisted as JSON by an external store; this crate only deals
//! with the in-memory representation.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schedule::ScheduleError;

// ── Datetime ranges ─────────────────────────────────────────────────

/// Wall-clock formatted timestamps use this layout, interpreted as UTC.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An allowed running window for a scheduled rule.
///
/// Either the formatted `begin`/`end` pair or the epoch-milli
/// `begin_timestamp`/`end_timestamp` pair may be used; the epoch form
/// wins when both are present. A rule may carry zero or more ranges,
/// empty meaning "always allowed".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatetimeRange {
    pub begin: String,
    pub end: String,
    pub begin_timestamp: i64,
    pub end_timestamp: i64,
}

impl DatetimeRange {
    /// Resolve to concrete UTC instants, enforcing `begin < end`.
    pub fn resolve(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), ScheduleError> {
        let begin = resolve_instant(self.begin_timestamp, &self.begin, "begin")?;
        let end = resolve_instant(self.end_timestamp, &self.end, "end")?;
        if begin >= end {
            return Err(ScheduleError::InvalidRange(format!(
                "begin {} is not before end {}",
                begin, end
            )));
        }
        Ok((begin, end))
    }
}

fn resolve_instant(
    timestamp_ms: i64,
    formatted: &str,
    field: &str,
) -> Result<DateTime<Utc>, ScheduleError> {
    if timestamp_ms > 0 {
        return DateTime::<Utc>::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
            ScheduleError::InvalidRange(format!("{field} timestamp {timestamp_ms} out of range"))
        });
    }
    let naive = NaiveDateTime::parse_from_str(formatted, DATETIME_FORMAT).map_err(|e| {
        ScheduleError::InvalidRange(format!("cannot parse {field} {formatted:?}: {e}"))
    })?;
    Ok(naive.and_utc())
}

// ── Restart policy ──────────────────────────────────────────────────

/// Restart-with-backoff parameters persisted with the rule.
///
/// The lifecycle controller itself never retries; this policy is carried
/// for an external patrol/supervisor that layers retries above `start()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

// ── Rule options ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleOptions {
    pub debug: bool,
    pub send_error: bool,
    pub concurrency: usize,
    pub buffer_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_strategy: Option<RestartPolicy>,
    /// Standard 5-field cron expression controlling scheduled starts.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cron: String,
    /// How long the rule runs after each cron fire, e.g. "10m".
    #[serde(skip_serializing_if = "String::is_empty")]
    pub duration: String,
    /// Allowed running windows. Empty means always allowed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cron_datetime_range: Vec<DatetimeRange>,
}

// ── Rule ────────────────────────────────────────────────────────────

/// A user-defined continuous query plus actions (sinks).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    pub triggered: bool,
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub sql: String,
    pub actions: Vec<HashMap<String, Value>>,
    pub options: RuleOptions,
}

impl Rule {
    /// A cron-driven rule: run from each cron fire for `duration`.
    pub fn is_schedule_rule(&self) -> bool {
        !self.options.cron.is_empty() && !self.options.duration.is_empty()
    }

    /// A rule constrained only by datetime ranges, without a cron window.
    pub fn is_long_running_schedule_rule(&self) -> bool {
        self.options.cron.is_empty()
            && self.options.duration.is_empty()
            && !self.options.cron_datetime_range.is_empty()
    }

    /// Build a rule with engine defaults, used in tests and demos.
    pub fn default_rule(id: &str, sql: &str) -> Self {
        let mut sink = HashMap::new();
        sink.insert("log".to_string(), Value::Object(Default::default()));
        Self {
            triggered: true,
            id: id.to_string(),
            name: String::new(),
            sql: sql.to_string(),
            actions: vec![sink],
            options: RuleOptions {
                send_error: true,
                concurrency: 1,
                buffer_length: 1024,
                restart_strategy: Some(RestartPolicy::default()),
                ..Default::default()
            },
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
