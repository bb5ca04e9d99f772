pub mod config;
pub mod error;

pub use config::Config;
pub use error::*;

/// Current wall-clock time as epoch milliseconds.
///
/// All run-timing fields (`lastStartTimestamp`, `lastStopTimestamp`, ...)
/// use this representation for API compatibility.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
