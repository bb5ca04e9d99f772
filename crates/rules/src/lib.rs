//! Streaming rule definitions and schedule evaluation.
//!
//! This crate provides:
//! - JSON-based rule definition with serde deserialization
//! - Pure schedule-window evaluators over cron expressions and
//!   allowed datetime ranges
//! - First-level rule validation (the second level is planning,
//!   which lives in the runtime crate)

pub mod schedule;
pub mod schema;
pub mod validation;

pub use schedule::ScheduleError;
pub use schema::{DatetimeRange, RestartPolicy, Rule, RuleOptions};
