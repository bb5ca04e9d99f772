//! Cron dispatch for scheduled rules.
//!
//! Controllers register fire callbacks against cron expressions through
//! [`CronDispatcher`]; the production [`TokioCron`] drives them from a
//! single tick task, while [`MockCron`] fires them synchronously from
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use edgeflow_rules::schedule::parse_cron;

use crate::error::RuleError;

/// Handle for a registered cron job, used to deregister it.
pub type EntryId = u64;

/// A fire callback. Must not block; spawn async work as needed.
pub type CronJob = Box<dyn Fn() + Send + Sync>;

/// Registry of cron-fired callbacks.
pub trait CronDispatcher: Send + Sync {
    /// Register `job` to fire on the schedule of `expr` (5 or 6 field).
    fn add_job(&self, expr: &str, job: CronJob) -> Result<EntryId, RuleError>;

    /// Deregister a job. Unknown ids are ignored.
    fn remove_job(&self, id: EntryId);
}

// ── Production dispatcher ───────────────────────────────────────────

struct CronEntry {
    schedule: cron::Schedule,
    next: Option<DateTime<Utc>>,
    job: CronJob,
}

struct TokioCronInner {
    entries: Mutex<HashMap<EntryId, CronEntry>>,
    next_id: AtomicU64,
}

/// Tick-driven dispatcher. One background task polls all registered
/// schedules; a fire that comes due between ticks runs on the next tick.
pub struct TokioCron {
    inner: Arc<TokioCronInner>,
    tick: tokio::task::JoinHandle<()>,
}

impl TokioCron {
    pub fn new(tick_interval: Duration) -> Self {
        let inner = Arc::new(TokioCronInner {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let tick_inner = Arc::clone(&inner);
        let tick = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                Self::fire_due(&tick_inner, Utc::now());
            }
        });
        Self { inner, tick }
    }

    fn fire_due(inner: &TokioCronInner, now: DateTime<Utc>) {
        let mut entries = lock(&inner.entries);
        for (id, entry) in entries.iter_mut() {
            let due = match entry.next {
                Some(next) => next <= now,
                None => false,
            };
            if due {
                debug!(entry_id = id, "cron entry fired");
                (entry.job)();
                entry.next = entry.schedule.after(&now).next();
            }
        }
    }
}

impl CronDispatcher for TokioCron {
    fn add_job(&self, expr: &str, job: CronJob) -> Result<EntryId, RuleError> {
        let schedule = parse_cron(expr)?;
        let next = schedule.after(&Utc::now()).next();
        if next.is_none() {
            warn!(expr, "cron expression has no future fire times");
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.entries).insert(id, CronEntry { schedule, next, job });
        Ok(id)
    }

    fn remove_job(&self, id: EntryId) {
        lock(&self.inner.entries).remove(&id);
    }
}

impl Drop for TokioCron {
    fn drop(&mut self) {
        self.tick.abort();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Test dispatcher ─────────────────────────────────────────────────

/// Dispatcher that never fires on its own; tests call [`MockCron::fire`]
/// to simulate the clock reaching a schedule boundary.
pub struct MockCron {
    jobs: Mutex<HashMap<EntryId, (String, CronJob)>>,
    next_id: AtomicU64,
}

impl MockCron {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fire every registered job once, in registration order.
    pub fn fire(&self) {
        let jobs = lock(&self.jobs);
        let mut ids: Vec<EntryId> = jobs.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some((_, job)) = jobs.get(&id) {
                job();
            }
        }
    }

    /// Number of currently registered jobs.
    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MockCron {
    fn default() -> Self {
        Self::new()
    }
}

impl CronDispatcher for MockCron {
    fn add_job(&self, expr: &str, job: CronJob) -> Result<EntryId, RuleError> {
        parse_cron(expr)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.jobs).insert(id, (expr.to_string(), job));
        Ok(id)
    }

    fn remove_job(&self, id: EntryId) {
        lock(&self.jobs).remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn mock_cron_fires_and_removes() {
        let cron = MockCron::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = cron
            .add_job("*/5 * * * * *", Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        cron.fire();
        cron.fire();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        cron.remove_job(id);
        cron.fire();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(cron.is_empty());
    }

    #[test]
    fn add_job_rejects_invalid_expression() {
        let cron = MockCron::new();
        let err = cron.add_job("not a cron", Box::new(|| {}));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn tokio_cron_fires_due_entries() {
        let cron = TokioCron::new(Duration::from_secs(3600)); // tick manually
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        cron.add_job("* * * * * *", Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        // Every-second schedule: the next fire is within one second, so a
        // tick two seconds out must fire it exactly once.
        let later = Utc::now() + chrono::Duration::seconds(2);
        TokioCron::fire_due(&cron.inner, later);
        TokioCron::fire_due(&cron.inner, later);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
