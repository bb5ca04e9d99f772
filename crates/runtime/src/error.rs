use edgeflow_core::EdgeflowError;
use edgeflow_rules::ScheduleError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    /// The planner rejected the rule (bad SQL, unknown stream, ...).
    #[error("plan error: {0}")]
    Plan(String),

    /// A topology operation failed.
    #[error("topology error: {0}")]
    Topology(String),

    /// Natural end of a bounded stream. Not a failure; the attached
    /// message, when non-empty, describes what completed.
    #[error("end of stream{}", fmt_eof(.0))]
    Eof(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Invalid(#[from] EdgeflowError),

    #[error("rule {0} already exists")]
    AlreadyExists(String),

    #[error("rule {0} is not found")]
    NotFound(String),
}

fn fmt_eof(msg: &str) -> String {
    if msg.is_empty() {
        String::new()
    } else {
        format!(": {msg}")
    }
}

impl RuleError {
    pub fn is_eof(&self) -> bool {
        matches!(self, RuleError::Eof(_))
    }
}
