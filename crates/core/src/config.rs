use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Engine config ───────────────────────────────────────────────────

/// Engine-level configuration, read from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding persisted rule definitions (JSON files).
    pub rules_dir: String,
    /// Cron dispatcher tick interval in milliseconds.
    pub cron_tick_ms: u64,
    /// Interval of the external schedule-rule patrol, in seconds.
    pub rule_patrol_interval_secs: u64,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            rules_dir: env_or("EDGEFLOW_RULES_DIR", "data/rules"),
            cron_tick_ms: env_u64("EDGEFLOW_CRON_TICK_MS", 1000),
            rule_patrol_interval_secs: env_u64("EDGEFLOW_RULE_PATROL_INTERVAL", 10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rules_dir: "data/rules".to_string(),
            cron_tick_ms: 1000,
            rule_patrol_interval_secs: 10,
        }
    }
}
