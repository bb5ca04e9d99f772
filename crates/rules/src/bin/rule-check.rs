//! rule-check: validate persisted rule definitions.
//!
//! Walks a rules directory, parses each JSON file as a rule definition,
//! runs first-level validation, and reports the next scheduled start for
//! cron rules. Exits non-zero when any rule fails.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use edgeflow_rules::schedule::next_schedule_start_ms;
use edgeflow_rules::validation::validate_rule;
use edgeflow_rules::Rule;

// ── CLI ─────────────────────────────────────────────────────────────

/// Validate rule JSON files and print their schedule state.
#[derive(Parser, Debug)]
#[command(name = "rule-check", version, about)]
struct Cli {
    /// Path to the rules directory.
    #[arg(long, env = "EDGEFLOW_RULES_DIR", default_value = "data/rules")]
    rules_dir: String,
}

fn check_file(path: &Path) -> anyhow::Result<Rule> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let rule: Rule = serde_json::from_str(&raw)
        .with_context(|| format!("cannot parse {}", path.display()))?;
    validate_rule(&rule).with_context(|| format!("invalid rule in {}", path.display()))?;
    Ok(rule)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    edgeflow_core::config::load_dotenv();

    let cli = Cli::parse();
    let mut checked = 0usize;
    let mut failed = 0usize;

    let entries = fs::read_dir(&cli.rules_dir)
        .with_context(|| format!("cannot open rules dir {}", cli.rules_dir))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        checked += 1;
        match check_file(&path) {
            Ok(rule) => {
                if rule.is_schedule_rule() {
                    let next = next_schedule_start_ms(&rule, Utc::now());
                    info!(rule_id = %rule.id, next_start_ms = next, "rule ok (scheduled)");
                } else {
                    info!(rule_id = %rule.id, triggered = rule.triggered, "rule ok");
                }
            }
            Err(e) => {
                failed += 1;
                error!(file = %path.display(), error = %e, "rule check failed");
            }
        }
    }

    if checked == 0 {
        warn!(dir = %cli.rules_dir, "no rule files found");
    }
    info!(checked, failed, "rule check complete");
    if failed > 0 {
        anyhow::bail!("{failed} of {checked} rules invalid");
    }
    Ok(())
}
