//! Rule lifecycle controller.
//!
//! One `RuleController` per rule id. It binds the definition to a live
//! [`Topology`] (or none), routes every start/stop intent through the
//! [`StateMachine`], and is the only component that talks to the
//! [`Planner`] and the topology. The pipeline's completion wait runs in
//! a detached watcher task that never holds the controller lock, so an
//! explicit `stop` can proceed while an open is in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use edgeflow_rules::schedule::{
    is_after_time_ranges, is_in_running_schedule, is_in_schedule_ranges, next_schedule_start_ms,
    parse_duration,
};
use edgeflow_rules::validation::validate_rule;
use edgeflow_rules::Rule;

use crate::cron::{CronDispatcher, CronJob, EntryId};
use crate::error::RuleError;
use crate::machine::{ActionSignal, RunState, StateMachine};
use crate::topology::{Planner, TopoGraph, TopoMetrics, Topology, TriggerUpdater};

/// A spawned lifecycle task. The watcher and the cron fire callback
/// both re-enter the controller, which re-enters them; spawning their
/// async fns directly would give each task a type containing itself,
/// so they go through these boxed constructors.
type LifecycleTask = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watch_task(
    ctrl: Arc<RuleController>,
    tp: Arc<dyn Topology>,
    rx: oneshot::Receiver<Option<RuleError>>,
) -> LifecycleTask {
    Box::pin(async move { ctrl.watch(tp, rx).await })
}

fn schedule_start_task(ctrl: Arc<RuleController>) -> LifecycleTask {
    Box::pin(async move { ctrl.schedule_start().await })
}

/// Scheduler binding for a cron-armed rule. Created when the rule is
/// armed, destroyed on explicit stop, delete, or rule replacement.
struct CronContext {
    entry_id: EntryId,
    duration: Duration,
    /// Cancels the pending auto-stop timer, if one is armed.
    stop_cancel: Option<oneshot::Sender<()>>,
    /// Consecutive scheduled starts that failed, reset on success.
    start_failures: u32,
}

struct ControllerInner {
    rule: Rule,
    topology: Option<Arc<dyn Topology>>,
    /// Graph and metrics of the last live topology, kept so status
    /// queries stay meaningful after a stop.
    frozen_graph: TopoGraph,
    frozen_metrics: TopoMetrics,
    cron_ctx: Option<CronContext>,
    deleted: bool,
}

/// Per-rule lifecycle controller. Construct with [`RuleController::new`]
/// and keep behind `Arc`; the watcher and scheduler tasks hold weak
/// references back into it.
pub struct RuleController {
    id: String,
    machine: StateMachine,
    planner: Arc<dyn Planner>,
    cron: Arc<dyn CronDispatcher>,
    trigger_updater: Arc<dyn TriggerUpdater>,
    inner: Mutex<ControllerInner>,
}

impl RuleController {
    pub fn new(
        rule: Rule,
        planner: Arc<dyn Planner>,
        cron: Arc<dyn CronDispatcher>,
        trigger_updater: Arc<dyn TriggerUpdater>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: rule.id.clone(),
            machine: StateMachine::new(&rule.id),
            planner,
            cron,
            trigger_updater,
            inner: Mutex::new(ControllerInner {
                rule,
                topology: None,
                frozen_graph: TopoGraph::new(),
                frozen_metrics: TopoMetrics::new(),
                cron_ctx: None,
                deleted: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── Lifecycle commands ──────────────────────────────────────────

    /// Start the rule. For a cron-scheduled rule this arms the scheduler
    /// instead of running immediately. Idempotent while already starting
    /// or running.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuleError> {
        if self.machine.trigger_action(ActionSignal::Start) {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        // A delete() may land between the machine decision and the lock.
        if inner.deleted {
            let _ = self.machine.transit(RunState::Stopped, None);
            return Err(RuleError::NotFound(self.id.clone()));
        }
        let (chain, res) = self.perform(&mut inner, ActionSignal::Start).await;
        if chain {
            self.drain(&mut inner).await;
        }
        res
    }

    /// Stop with the default "canceled manually" last will.
    pub async fn stop(self: &Arc<Self>) {
        self.stop_with_last_will("canceled manually").await;
    }

    /// Stop the rule; `msg` becomes the externally visible reason. An
    /// explicit stop also disarms the scheduler.
    pub async fn stop_with_last_will(self: &Arc<Self>, msg: &str) {
        if self.machine.trigger_action(ActionSignal::Stop) {
            return;
        }
        let mut inner = self.inner.lock().await;
        let (chain, _) = self
            .halt(&mut inner, RunState::Stopped, Some(msg.to_string()))
            .await;
        if chain {
            self.drain(&mut inner).await;
        }
    }

    /// Entry point for the cron dispatcher's fire callback. Re-checks the
    /// allowed-range gate before running; a tick outside the allowed
    /// ranges is a no-op.
    pub async fn schedule_start(self: &Arc<Self>) {
        if self.machine.trigger_action(ActionSignal::ScheduledStart) {
            return;
        }
        let mut inner = self.inner.lock().await;
        let (chain, res) = self.start_in_window(&mut inner).await;
        if let Err(e) = res {
            error!(rule_id = %self.id, error = %e, "scheduled start failed");
        }
        if chain {
            self.drain(&mut inner).await;
        }
    }

    /// Entry point for the auto-stop timer: parks the rule back at
    /// `ScheduledStop`, keeping the cron entry armed for the next window.
    pub async fn schedule_stop(self: &Arc<Self>) {
        if self.machine.trigger_action(ActionSignal::ScheduledStop) {
            return;
        }
        let mut inner = self.inner.lock().await;
        let (chain, _) = self.schedule_halt(&mut inner).await;
        if chain {
            self.drain(&mut inner).await;
        }
    }

    /// Static validation plus a dry planning run. Never mutates state.
    pub async fn validate(&self) -> Result<(), RuleError> {
        let inner = self.inner.lock().await;
        validate_rule(&inner.rule)?;
        self.planner.plan(&inner.rule).await.map(|_| ())
    }

    /// Atomically replace the bound rule. On any validation or planning
    /// failure the previous rule stays bound and a running topology is
    /// left untouched; on success the old topology (if any) is stopped
    /// before the new one is adopted, so there is never a window with
    /// two live topologies.
    pub async fn validate_and_run(self: &Arc<Self>, new_rule: Rule) -> Result<(), RuleError> {
        validate_rule(&new_rule)?;
        let mut inner = self.inner.lock().await;
        if inner.deleted {
            return Err(RuleError::NotFound(self.id.clone()));
        }
        let old_rule = std::mem::replace(&mut inner.rule, new_rule);
        let planned = match self.planner.plan(&inner.rule).await {
            Ok(tp) => tp,
            Err(e) => {
                inner.rule = old_rule;
                return Err(e);
            }
        };
        // Stop the old topology (and unpark a schedule-armed rule, whose
        // machine also sits stoppable at ScheduledStop) before adopting
        // the new plan.
        if !self.machine.trigger_action(ActionSignal::Stop) {
            let (chain, _) = self
                .halt(&mut inner, RunState::Stopped, Some("rule updated".to_string()))
                .await;
            if chain {
                self.drain(&mut inner).await;
            }
        }
        self.disarm_schedule(&mut inner);
        let planned: Arc<dyn Topology> = Arc::from(planned);
        if inner.rule.triggered {
            inner.topology = Some(planned);
            if !self.machine.trigger_action(ActionSignal::Start) {
                let (chain, res) = self.perform(&mut inner, ActionSignal::Start).await;
                if chain {
                    self.drain(&mut inner).await;
                }
                res?;
            }
        } else {
            // Keep the planned shape visible, discard the unstarted
            // topology, leave the rule stopped.
            planned.cancel().await;
            inner.frozen_graph = planned.graph();
            inner.frozen_metrics = planned.metrics();
        }
        Ok(())
    }

    /// Tear the rule down for good. Irreversible; the controller rejects
    /// further commands afterward.
    pub async fn delete(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        inner.deleted = true;
        self.disarm_schedule(&mut inner);
        if let Some(tp) = inner.topology.take() {
            tp.cancel().await;
            inner.frozen_graph = tp.graph();
            inner.frozen_metrics = tp.metrics();
            tp.remove_metrics();
        }
        let _ = self
            .machine
            .transit(RunState::Stopped, Some("deleted".to_string()));
        info!(rule_id = %self.id, "rule deleted");
    }

    // ── Signal execution ────────────────────────────────────────────

    /// Perform the work for a signal the state machine told us to handle
    /// now (state already moved to Starting/Stopping). Returns whether
    /// the resulting transit asked for a queue drain.
    async fn perform(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
        signal: ActionSignal,
    ) -> (bool, Result<(), RuleError>) {
        match signal {
            ActionSignal::Start => {
                if inner.rule.is_schedule_rule() {
                    self.arm_schedule(inner).await
                } else if inner.rule.is_long_running_schedule_rule() {
                    self.start_long_running(inner).await
                } else {
                    self.run_now(inner, None).await
                }
            }
            ActionSignal::ScheduledStart => self.start_in_window(inner).await,
            ActionSignal::Stop => {
                self.halt(inner, RunState::Stopped, Some("canceled manually".to_string()))
                    .await
            }
            ActionSignal::ScheduledStop => self.schedule_halt(inner).await,
        }
    }

    /// Drain queued signals after a transition settled. Loops rather
    /// than recursing; each drained signal that performs work settles
    /// before the next one is popped.
    async fn drain(self: &Arc<Self>, inner: &mut ControllerInner) {
        while let Some(signal) = self.machine.pop_action() {
            debug!(rule_id = %self.id, %signal, "draining queued action");
            if self.machine.apply_popped(signal) {
                continue;
            }
            let (chain, res) = self.perform(inner, signal).await;
            if let Err(e) = res {
                warn!(rule_id = %self.id, %signal, error = %e, "queued action failed");
            }
            if !chain {
                break;
            }
        }
    }

    /// Plan (when no topology is parked), open, and hand the completion
    /// channel to a detached watcher. On success transits to `Running`
    /// and arms the auto-stop timer when `auto_stop` is given.
    async fn run_now(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
        auto_stop: Option<Duration>,
    ) -> (bool, Result<(), RuleError>) {
        match self.launch(inner).await {
            Ok(()) => {
                if let Some(d) = auto_stop {
                    self.arm_auto_stop(inner, d);
                }
                if let Some(ctx) = inner.cron_ctx.as_mut() {
                    ctx.start_failures = 0;
                }
                (self.machine.transit(RunState::Running, None), Ok(()))
            }
            Err(e) => {
                if let Some(ctx) = inner.cron_ctx.as_mut() {
                    ctx.start_failures += 1;
                }
                let chain = self
                    .machine
                    .transit(RunState::StoppedByErr, Some(e.to_string()));
                (chain, Err(e))
            }
        }
    }

    async fn launch(self: &Arc<Self>, inner: &mut ControllerInner) -> Result<(), RuleError> {
        let tp: Arc<dyn Topology> = match inner.topology.take() {
            Some(tp) => tp,
            None => Arc::from(self.planner.plan(&inner.rule).await?),
        };
        let rx = tp.open().await;
        inner.topology = Some(Arc::clone(&tp));
        tokio::spawn(watch_task(Arc::clone(self), tp, rx));
        info!(rule_id = %self.id, "topology launched");
        Ok(())
    }

    /// Watcher body: blocks on the single completion value, classifies
    /// it, and reports back into the synchronized state-update path.
    async fn watch(
        self: Arc<Self>,
        tp: Arc<dyn Topology>,
        rx: oneshot::Receiver<Option<RuleError>>,
    ) {
        let completion = rx.await;
        let mut inner = self.inner.lock().await;
        // A concurrent explicit stop (or update) already snapshotted and
        // transited; nothing left to report.
        let live = match inner.topology.take() {
            Some(live) if Arc::ptr_eq(&live, &tp) => live,
            other => {
                inner.topology = other;
                return;
            }
        };
        let (state, will, eof) = match completion {
            Ok(Some(RuleError::Eof(msg))) => {
                let will = if msg.is_empty() {
                    "done".to_string()
                } else {
                    format!("done: {msg}")
                };
                (RunState::Stopped, will, true)
            }
            Ok(Some(e)) => (RunState::StoppedByErr, e.to_string(), false),
            Ok(None) | Err(_) => (RunState::Stopped, "canceled manually".to_string(), false),
        };
        match state {
            RunState::StoppedByErr => {
                error!(rule_id = %self.id, last_will = %will, "rule stopped by error")
            }
            _ => info!(rule_id = %self.id, last_will = %will, "rule finished"),
        }
        // Defensive cleanup; cancel is idempotent.
        live.cancel().await;
        inner.frozen_graph = live.graph();
        inner.frozen_metrics = live.metrics();
        if eof {
            // Natural completion: the persisted rule must not restart on
            // the next process boot.
            self.trigger_updater.update_trigger(&self.id, false).await;
        }
        if self.machine.transit(state, Some(will)) {
            self.drain(&mut inner).await;
        }
    }

    /// Cancel the live topology (if any), snapshot its graph and
    /// metrics, and transit. A plain `Stopped` also disarms the
    /// scheduler; `ScheduledStop` keeps it armed.
    async fn halt(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
        state: RunState,
        will: Option<String>,
    ) -> (bool, Result<(), RuleError>) {
        if state == RunState::Stopped {
            self.disarm_schedule(inner);
        }
        if let Some(tp) = inner.topology.take() {
            tp.cancel().await;
            inner.frozen_graph = tp.graph();
            inner.frozen_metrics = tp.metrics();
        }
        (self.machine.transit(state, will), Ok(()))
    }

    /// Park after a window closes, or finish for good with "schedule
    /// terminated" when every allowed range is already in the past.
    async fn schedule_halt(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
    ) -> (bool, Result<(), RuleError>) {
        if is_after_time_ranges(Utc::now(), &inner.rule.options.cron_datetime_range) {
            self.halt(
                inner,
                RunState::Stopped,
                Some("schedule terminated".to_string()),
            )
            .await
        } else {
            self.halt(inner, RunState::ScheduledStop, None).await
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Arm a cron-scheduled rule: register the fire callback and, when
    /// the process (re)starts inside a running window, resume execution
    /// immediately for the remaining window time.
    async fn arm_schedule(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
    ) -> (bool, Result<(), RuleError>) {
        let now = Utc::now();
        let ranges = &inner.rule.options.cron_datetime_range;
        if is_after_time_ranges(now, ranges) {
            info!(rule_id = %self.id, "all schedule ranges are in the past");
            let chain = self
                .machine
                .transit(RunState::Stopped, Some("schedule terminated".to_string()));
            return (chain, Ok(()));
        }
        let duration = match parse_duration(&inner.rule.options.duration) {
            Ok(d) => d,
            Err(e) => {
                let err = RuleError::from(e);
                let chain = self
                    .machine
                    .transit(RunState::StoppedByErr, Some(err.to_string()));
                return (chain, Err(err));
            }
        };
        let weak = Arc::downgrade(self);
        let job: CronJob = Box::new(move || {
            if let Some(ctrl) = weak.upgrade() {
                tokio::spawn(schedule_start_task(ctrl));
            }
        });
        let entry_id = match self.cron.add_job(&inner.rule.options.cron, job) {
            Ok(id) => id,
            Err(e) => {
                let chain = self
                    .machine
                    .transit(RunState::StoppedByErr, Some(e.to_string()));
                return (chain, Err(e));
            }
        };
        inner.cron_ctx = Some(CronContext {
            entry_id,
            duration,
            stop_cancel: None,
            start_failures: 0,
        });
        info!(rule_id = %self.id, cron = %inner.rule.options.cron, "schedule armed");
        // Restart-mid-window reconciliation: resume instead of idling
        // until the next tick.
        if is_in_schedule_ranges(now, ranges).unwrap_or(false) {
            match is_in_running_schedule(&inner.rule.options.cron, now, duration) {
                Ok((true, remaining)) => {
                    info!(rule_id = %self.id, ?remaining, "resuming inside running window");
                    return self.run_now(inner, Some(remaining)).await;
                }
                Ok((false, _)) => {}
                Err(e) => warn!(rule_id = %self.id, error = %e, "window check failed"),
            }
        }
        (self.machine.transit(RunState::ScheduledStop, None), Ok(()))
    }

    /// Run one scheduled window after a cron fire.
    async fn start_in_window(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
    ) -> (bool, Result<(), RuleError>) {
        let now = Utc::now();
        let ranges = &inner.rule.options.cron_datetime_range;
        if is_after_time_ranges(now, ranges) {
            self.disarm_schedule(inner);
            let chain = self
                .machine
                .transit(RunState::Stopped, Some("schedule terminated".to_string()));
            return (chain, Ok(()));
        }
        if !is_in_schedule_ranges(now, ranges).unwrap_or(false) {
            debug!(rule_id = %self.id, "cron fired outside allowed ranges");
            return (self.machine.transit(RunState::ScheduledStop, None), Ok(()));
        }
        let auto_stop = match inner.cron_ctx.as_ref() {
            Some(ctx) => Some(ctx.duration),
            // Long-running schedule rules carry no window duration; the
            // patrol stops them when the range closes.
            None if inner.rule.is_long_running_schedule_rule() => None,
            // Cron context gone (e.g. deleted concurrently with a fire).
            None => {
                let chain = self.machine.transit(RunState::Stopped, None);
                return (chain, Ok(()));
            }
        };
        self.run_now(inner, auto_stop).await
    }

    /// Start a rule constrained only by datetime ranges: run when inside
    /// one, park armed when before one. The external patrol drives the
    /// range boundaries via `schedule_start`/`schedule_stop`.
    async fn start_long_running(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
    ) -> (bool, Result<(), RuleError>) {
        let now = Utc::now();
        let ranges = &inner.rule.options.cron_datetime_range;
        if is_after_time_ranges(now, ranges) {
            let chain = self
                .machine
                .transit(RunState::Stopped, Some("schedule terminated".to_string()));
            return (chain, Ok(()));
        }
        if is_in_schedule_ranges(now, ranges).unwrap_or(false) {
            return self.run_now(inner, None).await;
        }
        (self.machine.transit(RunState::ScheduledStop, None), Ok(()))
    }

    /// One-shot timer that parks the rule after the window closes,
    /// cancellable by explicit stop, delete, or re-arming.
    fn arm_auto_stop(self: &Arc<Self>, inner: &mut ControllerInner, after: Duration) {
        let (tx, rx) = oneshot::channel::<()>();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = rx => {}
                _ = tokio::time::sleep(after) => {
                    if let Some(ctrl) = weak.upgrade() {
                        ctrl.schedule_stop().await;
                    }
                }
            }
        });
        if let Some(ctx) = inner.cron_ctx.as_mut() {
            // Replacing the sender cancels any stale timer.
            ctx.stop_cancel = Some(tx);
        }
    }

    fn disarm_schedule(&self, inner: &mut ControllerInner) {
        if let Some(ctx) = inner.cron_ctx.take() {
            self.cron.remove_job(ctx.entry_id);
            if let Some(cancel) = ctx.stop_cancel {
                let _ = cancel.send(());
            }
            debug!(rule_id = %self.id, "schedule disarmed");
        }
    }

    // ── Status accessors ────────────────────────────────────────────

    pub fn state(&self) -> RunState {
        self.machine.current_state()
    }

    pub fn last_will(&self) -> String {
        self.machine.last_will()
    }

    pub async fn rule(&self) -> Rule {
        self.inner.lock().await.rule.clone()
    }

    /// Structured status document. Field order is stable for API
    /// compatibility: status, message, lastStartTimestamp,
    /// lastStopTimestamp, nextStartTimestamp, then flattened metrics.
    pub async fn status_map(&self) -> IndexMap<String, Value> {
        let inner = self.inner.lock().await;
        let mut doc = IndexMap::new();
        doc.insert(
            "status".to_string(),
            json!(self.machine.current_state().as_str()),
        );
        doc.insert("message".to_string(), json!(self.machine.last_will()));
        doc.insert(
            "lastStartTimestamp".to_string(),
            json!(self.machine.last_start_ms()),
        );
        doc.insert(
            "lastStopTimestamp".to_string(),
            json!(self.machine.last_stop_ms()),
        );
        doc.insert(
            "nextStartTimestamp".to_string(),
            json!(next_schedule_start_ms(&inner.rule, Utc::now())),
        );
        if let Some(ctx) = inner.cron_ctx.as_ref() {
            doc.insert(
                "consecutiveStartFailures".to_string(),
                json!(ctx.start_failures),
            );
        }
        let samples = match inner.topology.as_ref() {
            Some(tp) => tp.metrics(),
            None => inner.frozen_metrics.clone(),
        };
        for sample in samples {
            doc.insert(sample.key, sample.value);
        }
        doc
    }

    /// The status document rendered as pretty JSON.
    pub async fn status_message(&self) -> String {
        let doc = self.status_map().await;
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
    }

    /// Planned graph of the live topology, or the frozen snapshot after
    /// a stop.
    pub async fn topo_graph(&self) -> TopoGraph {
        let inner = self.inner.lock().await;
        match inner.topology.as_ref() {
            Some(tp) => tp.graph(),
            None => inner.frozen_graph.clone(),
        }
    }

    pub async fn metrics(&self) -> TopoMetrics {
        let inner = self.inner.lock().await;
        match inner.topology.as_ref() {
            Some(tp) => tp.metrics(),
            None => inner.frozen_metrics.clone(),
        }
    }

    pub async fn streams(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        match inner.topology.as_ref() {
            Some(tp) => tp.streams(),
            None => Vec::new(),
        }
    }

    pub async fn sink_schema(&self) -> Option<Value> {
        let inner = self.inner.lock().await;
        inner.topology.as_ref().and_then(|tp| tp.sink_schema())
    }

    /// Rewind one source stream of the live topology.
    pub async fn reset_stream_offset(&self, name: &str, input: Value) -> Result<(), RuleError> {
        let inner = self.inner.lock().await;
        match inner.topology.as_ref() {
            Some(tp) => tp.reset_stream_offset(name, input).await,
            None => Err(RuleError::Topology(format!(
                "rule {} is not running",
                self.id
            ))),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::cron::MockCron;
    use crate::topology::MetricSample;

    #[derive(Default)]
    struct TopoState {
        opened: AtomicBool,
        cancelled: AtomicBool,
        metrics_removed: AtomicBool,
        tx: StdMutex<Option<oneshot::Sender<Option<RuleError>>>>,
    }

    impl TopoState {
        fn complete(&self, outcome: Option<RuleError>) {
            if let Some(tx) = self.tx.lock().unwrap().take() {
                let _ = tx.send(outcome);
            }
        }
    }

    struct MockTopology(Arc<TopoState>);

    #[async_trait]
    impl Topology for MockTopology {
        async fn open(&self) -> oneshot::Receiver<Option<RuleError>> {
            let (tx, rx) = oneshot::channel();
            self.0.opened.store(true, Ordering::SeqCst);
            *self.0.tx.lock().unwrap() = Some(tx);
            rx
        }

        async fn cancel(&self) {
            self.0.cancelled.store(true, Ordering::SeqCst);
            // Closing the channel is how cancellation surfaces.
            self.0.tx.lock().unwrap().take();
        }

        fn metric_keys(&self) -> Vec<String> {
            vec!["op_1_records_in_total".to_string()]
        }

        fn metrics(&self) -> TopoMetrics {
            vec![MetricSample {
                key: "op_1_records_in_total".to_string(),
                value: json!(42),
            }]
        }

        fn remove_metrics(&self) {
            self.0.metrics_removed.store(true, Ordering::SeqCst);
        }

        fn graph(&self) -> TopoGraph {
            let mut g = TopoGraph::new();
            g.insert("source_demo".to_string(), vec!["op_1".to_string()]);
            g
        }

        fn streams(&self) -> Vec<String> {
            vec!["demo".to_string()]
        }

        fn sink_schema(&self) -> Option<Value> {
            None
        }

        async fn reset_stream_offset(&self, _name: &str, _input: Value) -> Result<(), RuleError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockPlanner {
        fail: AtomicBool,
        planned: StdMutex<Vec<Arc<TopoState>>>,
    }

    impl MockPlanner {
        fn planned_count(&self) -> usize {
            self.planned.lock().unwrap().len()
        }

        fn planned(&self, i: usize) -> Arc<TopoState> {
            Arc::clone(&self.planned.lock().unwrap()[i])
        }
    }

    #[async_trait]
    impl Planner for MockPlanner {
        async fn plan(&self, _rule: &Rule) -> Result<Box<dyn Topology>, RuleError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RuleError::Plan("mock plan failure".to_string()));
            }
            let state = Arc::new(TopoState::default());
            self.planned.lock().unwrap().push(Arc::clone(&state));
            Ok(Box::new(MockTopology(state)))
        }
    }

    #[derive(Default)]
    struct RecordingUpdater {
        calls: StdMutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl TriggerUpdater for RecordingUpdater {
        async fn update_trigger(&self, rule_id: &str, triggered: bool) {
            self.calls
                .lock()
                .unwrap()
                .push((rule_id.to_string(), triggered));
        }
    }

    struct Fixture {
        planner: Arc<MockPlanner>,
        cron: Arc<MockCron>,
        updater: Arc<RecordingUpdater>,
        ctrl: Arc<RuleController>,
    }

    fn fixture(rule: Rule) -> Fixture {
        let planner = Arc::new(MockPlanner::default());
        let cron = Arc::new(MockCron::new());
        let updater = Arc::new(RecordingUpdater::default());
        let ctrl = RuleController::new(
            rule,
            Arc::clone(&planner) as Arc<dyn Planner>,
            Arc::clone(&cron) as Arc<dyn CronDispatcher>,
            Arc::clone(&updater) as Arc<dyn TriggerUpdater>,
        );
        Fixture {
            planner,
            cron,
            updater,
            ctrl,
        }
    }

    fn plain_rule() -> Rule {
        Rule::default_rule("r1", "select * from demo")
    }

    fn scheduled_rule() -> Rule {
        let mut rule = Rule::default_rule("r1", "select * from demo");
        // Fires only at midnight on Jan 1st; tests drive it via MockCron.
        rule.options.cron = "0 0 1 1 *".to_string();
        rule.options.duration = "1s".to_string();
        rule
    }

    async fn wait_state(ctrl: &Arc<RuleController>, expect: RunState) {
        for _ in 0..200 {
            if ctrl.state() == expect {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never reached {expect:?}, stuck at {:?}", ctrl.state());
    }

    #[tokio::test]
    async fn start_runs_and_double_start_is_idempotent() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::Running);
        assert_eq!(f.planner.planned_count(), 1);
        assert!(f.planner.planned(0).opened.load(Ordering::SeqCst));

        // Second start is a no-op: no error, no second pipeline.
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::Running);
        assert_eq!(f.planner.planned_count(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_and_records_last_will() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        f.ctrl.stop().await;
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.ctrl.last_will(), "canceled manually");
        assert!(f.planner.planned(0).cancelled.load(Ordering::SeqCst));
        // Status stays meaningful after stop via the frozen snapshot.
        let doc = f.ctrl.status_map().await;
        assert_eq!(doc["op_1_records_in_total"], json!(42));
        assert!(!f.ctrl.topo_graph().await.is_empty());
    }

    #[tokio::test]
    async fn stop_immediately_after_start_settles_stopped() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        f.ctrl.stop().await;
        wait_state(&f.ctrl, RunState::Stopped).await;
        assert_eq!(f.ctrl.last_will(), "canceled manually");
    }

    #[tokio::test]
    async fn runtime_error_parks_stopped_by_err() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        f.planner
            .planned(0)
            .complete(Some(RuleError::Topology("sink unreachable".to_string())));
        wait_state(&f.ctrl, RunState::StoppedByErr).await;
        assert_eq!(f.ctrl.last_will(), "topology error: sink unreachable");
        // Crashed rules stay inert until an explicit start.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.ctrl.state(), RunState::StoppedByErr);
        assert_eq!(f.planner.planned_count(), 1);

        // And an explicit start revives them.
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::Running);
        assert_eq!(f.planner.planned_count(), 2);
    }

    #[tokio::test]
    async fn eof_completion_stops_and_clears_trigger() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        f.planner
            .planned(0)
            .complete(Some(RuleError::Eof("demo is finished".to_string())));
        wait_state(&f.ctrl, RunState::Stopped).await;
        assert_eq!(f.ctrl.last_will(), "done: demo is finished");
        assert_eq!(
            f.updater.calls.lock().unwrap().as_slice(),
            &[("r1".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn closed_completion_channel_means_canceled_manually() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        f.planner.planned(0).complete(None);
        wait_state(&f.ctrl, RunState::Stopped).await;
        assert_eq!(f.ctrl.last_will(), "canceled manually");
        assert!(f.updater.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_update_leaves_running_rule_untouched() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        let graph_before = f.ctrl.topo_graph().await;

        // Statically invalid rule.
        let mut bad = plain_rule();
        bad.sql = String::new();
        assert!(f.ctrl.validate_and_run(bad).await.is_err());

        // Planner rejection.
        f.planner.fail.store(true, Ordering::SeqCst);
        let mut unplannable = plain_rule();
        unplannable.sql = "select * from nosuchstream".to_string();
        assert!(f.ctrl.validate_and_run(unplannable).await.is_err());

        assert_eq!(f.ctrl.state(), RunState::Running);
        assert_eq!(f.ctrl.topo_graph().await, graph_before);
        assert_eq!(f.ctrl.rule().await.sql, "select * from demo");
        assert!(!f.planner.planned(0).cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn update_swaps_topology_without_overlap() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();

        let mut updated = plain_rule();
        updated.sql = "select a from demo".to_string();
        f.ctrl.validate_and_run(updated).await.unwrap();

        assert_eq!(f.ctrl.state(), RunState::Running);
        assert_eq!(f.planner.planned_count(), 2);
        assert!(f.planner.planned(0).cancelled.load(Ordering::SeqCst));
        assert!(f.planner.planned(1).opened.load(Ordering::SeqCst));
        assert!(!f.planner.planned(1).cancelled.load(Ordering::SeqCst));
        assert_eq!(f.ctrl.rule().await.sql, "select a from demo");
    }

    #[tokio::test]
    async fn untriggered_update_plans_but_does_not_run() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();

        let mut updated = plain_rule();
        updated.triggered = false;
        f.ctrl.validate_and_run(updated).await.unwrap();

        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.planner.planned_count(), 2);
        let fresh = f.planner.planned(1);
        assert!(!fresh.opened.load(Ordering::SeqCst));
        assert!(fresh.cancelled.load(Ordering::SeqCst));
        // The planned shape is still visible while stopped.
        assert!(!f.ctrl.topo_graph().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_rule_runs_one_window_per_fire() {
        let f = fixture(scheduled_rule());
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::ScheduledStop);
        assert_eq!(f.cron.len(), 1);
        assert_eq!(f.planner.planned_count(), 0);

        f.cron.fire();
        wait_state(&f.ctrl, RunState::Running).await;
        assert_eq!(f.planner.planned_count(), 1);

        // The 1s auto-stop parks it back at ScheduledStop, armed.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        wait_state(&f.ctrl, RunState::ScheduledStop).await;
        assert!(f.planner.planned(0).cancelled.load(Ordering::SeqCst));
        assert_eq!(f.cron.len(), 1);

        // Next fire runs a fresh window.
        f.cron.fire();
        wait_state(&f.ctrl, RunState::Running).await;
        assert_eq!(f.planner.planned_count(), 2);

        // Explicit stop disarms the schedule entirely.
        f.ctrl.stop().await;
        wait_state(&f.ctrl, RunState::Stopped).await;
        assert!(f.cron.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_cancels_pending_auto_stop() {
        let f = fixture(scheduled_rule());
        f.ctrl.start().await.unwrap();
        f.cron.fire();
        wait_state(&f.ctrl, RunState::Running).await;

        f.ctrl.stop().await;
        assert_eq!(f.ctrl.state(), RunState::Stopped);

        // The orphaned timer must not fire a schedule stop later.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.ctrl.last_will(), "canceled manually");
    }

    #[tokio::test]
    async fn expired_ranges_terminate_the_schedule() {
        let mut rule = scheduled_rule();
        rule.options.cron_datetime_range = vec![edgeflow_rules::DatetimeRange {
            begin: "2020-01-01 00:00:00".to_string(),
            end: "2020-01-02 00:00:00".to_string(),
            ..Default::default()
        }];
        let f = fixture(rule);
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.ctrl.last_will(), "schedule terminated");
        assert!(f.cron.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_outside_allowed_ranges_is_a_noop() {
        let mut rule = scheduled_rule();
        rule.options.cron_datetime_range = vec![edgeflow_rules::DatetimeRange {
            begin: "2999-01-01 00:00:00".to_string(),
            end: "2999-01-02 00:00:00".to_string(),
            ..Default::default()
        }];
        let f = fixture(rule);
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::ScheduledStop);

        f.cron.fire();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.ctrl.state(), RunState::ScheduledStop);
        assert_eq!(f.planner.planned_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_of_armed_scheduled_rule_keeps_schedule() {
        let f = fixture(scheduled_rule());
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::ScheduledStop);
        assert_eq!(f.cron.len(), 1);

        let mut updated = scheduled_rule();
        updated.sql = "select a from demo".to_string();
        f.ctrl.validate_and_run(updated).await.unwrap();

        // Still armed under the new definition, and the next fire runs
        // the updated query.
        assert_eq!(f.ctrl.state(), RunState::ScheduledStop);
        assert_eq!(f.cron.len(), 1);
        f.cron.fire();
        wait_state(&f.ctrl, RunState::Running).await;
        assert_eq!(f.ctrl.rule().await.sql, "select a from demo");
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_stop_terminates_once_ranges_pass() {
        let f = fixture(scheduled_rule());
        f.ctrl.start().await.unwrap();
        f.cron.fire();
        wait_state(&f.ctrl, RunState::Running).await;

        // The last allowed window ends while the rule is running: the
        // stop must finish the schedule, not park for a next fire.
        f.ctrl.inner.lock().await.rule.options.cron_datetime_range =
            vec![edgeflow_rules::DatetimeRange {
                begin: "2020-01-01 00:00:00".to_string(),
                end: "2020-01-02 00:00:00".to_string(),
                ..Default::default()
            }];
        f.ctrl.schedule_stop().await;
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.ctrl.last_will(), "schedule terminated");
        assert!(f.cron.is_empty());
    }

    fn long_running_rule(begin: &str, end: &str) -> Rule {
        let mut rule = Rule::default_rule("r1", "select * from demo");
        rule.options.cron_datetime_range = vec![edgeflow_rules::DatetimeRange {
            begin: begin.to_string(),
            end: end.to_string(),
            ..Default::default()
        }];
        rule
    }

    #[tokio::test]
    async fn long_running_rule_runs_inside_its_range() {
        let f = fixture(long_running_rule("2020-01-01 00:00:00", "2999-01-01 00:00:00"));
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::Running);
        // Range rules never register with the cron dispatcher.
        assert!(f.cron.is_empty());

        // The patrol parks it when the range closes, still armed.
        f.ctrl.schedule_stop().await;
        assert_eq!(f.ctrl.state(), RunState::ScheduledStop);
        assert!(f.planner.planned(0).cancelled.load(Ordering::SeqCst));

        // And revives it on the next in-range tick.
        f.ctrl.schedule_start().await;
        wait_state(&f.ctrl, RunState::Running).await;
        assert_eq!(f.planner.planned_count(), 2);
    }

    #[tokio::test]
    async fn long_running_rule_parks_before_its_range() {
        let f = fixture(long_running_rule("2999-01-01 00:00:00", "2999-06-01 00:00:00"));
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::ScheduledStop);
        assert_eq!(f.planner.planned_count(), 0);
    }

    #[tokio::test]
    async fn long_running_rule_terminates_after_its_range() {
        let f = fixture(long_running_rule("2020-01-01 00:00:00", "2020-06-01 00:00:00"));
        f.ctrl.start().await.unwrap();
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.ctrl.last_will(), "schedule terminated");
    }

    #[tokio::test]
    async fn delete_tears_down_and_rejects_restart() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        f.ctrl.delete().await;
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        let tp = f.planner.planned(0);
        assert!(tp.cancelled.load(Ordering::SeqCst));
        assert!(tp.metrics_removed.load(Ordering::SeqCst));

        let err = f.ctrl.start().await.unwrap_err();
        assert!(matches!(err, RuleError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_rechecks_delete_under_the_lock() {
        let f = fixture(plain_rule());
        // Mark deleted out of band, as a racing delete() would after the
        // machine already accepted the start.
        f.ctrl.inner.lock().await.deleted = true;
        let err = f.ctrl.start().await.unwrap_err();
        assert!(matches!(err, RuleError::NotFound(_)));
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.planner.planned_count(), 0);
    }

    #[tokio::test]
    async fn status_map_field_order_is_stable() {
        let f = fixture(plain_rule());
        f.ctrl.start().await.unwrap();
        let doc = f.ctrl.status_map().await;
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "status",
                "message",
                "lastStartTimestamp",
                "lastStopTimestamp",
                "nextStartTimestamp",
                "op_1_records_in_total",
            ]
        );
        assert_eq!(doc["status"], json!("running"));
        assert_eq!(doc["nextStartTimestamp"], json!(0));
        assert!(doc["lastStartTimestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn queued_stop_applies_after_start_settles() {
        let f = fixture(plain_rule());
        // Force Starting, queue a stop behind it, then settle the start.
        assert!(!f.ctrl.machine.trigger_action(ActionSignal::Start));
        assert!(f.ctrl.machine.trigger_action(ActionSignal::Stop));
        let mut inner = f.ctrl.inner.lock().await;
        let (chain, res) = f.ctrl.run_now(&mut inner, None).await;
        res.unwrap();
        assert!(chain);
        f.ctrl.drain(&mut inner).await;
        drop(inner);
        assert_eq!(f.ctrl.state(), RunState::Stopped);
        assert_eq!(f.ctrl.last_will(), "canceled manually");
        assert!(f.planner.planned(0).cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn plan_failure_on_start_is_a_launch_error() {
        let f = fixture(plain_rule());
        f.planner.fail.store(true, Ordering::SeqCst);
        let err = f.ctrl.start().await.unwrap_err();
        assert!(matches!(err, RuleError::Plan(_)));
        assert_eq!(f.ctrl.state(), RunState::StoppedByErr);
        assert_eq!(f.ctrl.last_will(), "plan error: mock plan failure");
    }

    #[tokio::test]
    async fn reset_stream_offset_requires_live_topology() {
        let f = fixture(plain_rule());
        assert!(f.ctrl.reset_stream_offset("demo", json!(0)).await.is_err());
        f.ctrl.start().await.unwrap();
        f.ctrl.reset_stream_offset("demo", json!(0)).await.unwrap();
        assert_eq!(f.ctrl.streams().await, vec!["demo".to_string()]);
    }
}
