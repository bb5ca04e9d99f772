//! First-level rule validation.
//!
//! Checks the parts of a rule that can be judged without planning a
//! topology: identity, query presence, actions, and schedule options.
//! Planning (the second level) is the runtime's job.

use chrono::Duration as ChronoDuration;
use edgeflow_core::EdgeflowError;

use crate::schedule::{parse_cron, parse_duration};
use crate::schema::Rule;

/// Validate a rule definition. Returns the first problem found.
pub fn validate_rule(rule: &Rule) -> Result<(), EdgeflowError> {
    if rule.id.trim().is_empty() {
        return Err(EdgeflowError::InvalidRule("rule id is required".into()));
    }
    if rule.sql.trim().is_empty() {
        return Err(EdgeflowError::InvalidRule(format!(
            "rule {}: sql is required",
            rule.id
        )));
    }
    if rule.actions.is_empty() {
        return Err(EdgeflowError::InvalidRule(format!(
            "rule {}: at least one action is required",
            rule.id
        )));
    }
    validate_schedule_options(rule)
}

fn validate_schedule_options(rule: &Rule) -> Result<(), EdgeflowError> {
    let opts = &rule.options;
    if opts.cron.is_empty() != opts.duration.is_empty() {
        return Err(EdgeflowError::InvalidRule(format!(
            "rule {}: cron and duration must be set together",
            rule.id
        )));
    }
    for range in &opts.cron_datetime_range {
        range
            .resolve()
            .map_err(|e| EdgeflowError::Schedule(format!("rule {}: {e}", rule.id)))?;
    }
    if rule.is_schedule_rule() {
        let schedule = parse_cron(&opts.cron)
            .map_err(|e| EdgeflowError::Schedule(format!("rule {}: {e}", rule.id)))?;
        let duration = parse_duration(&opts.duration)
            .map_err(|e| EdgeflowError::Schedule(format!("rule {}: {e}", rule.id)))?;
        // The window must close before the next fire opens a new one,
        // otherwise two runs of the same rule would overlap.
        let mut fires = schedule.upcoming(chrono::Utc);
        if let (Some(a), Some(b)) = (fires.next(), fires.next()) {
            let gap = b - a;
            let d = ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX);
            if d > gap {
                return Err(EdgeflowError::InvalidRule(format!(
                    "rule {}: duration {} exceeds the cron interval",
                    rule.id, opts.duration
                )));
            }
        }
    }
    Ok(())
}
