//! Execution topology seams.
//!
//! The controller never builds or runs dataflow graphs itself; it drives
//! them through these traits so that planning and execution stay
//! swappable (and mockable in tests).

use async_trait::async_trait;
use tokio::sync::oneshot;

use edgeflow_rules::Rule;

use crate::error::RuleError;

/// Edges of the planned dataflow graph, keyed by upstream node name.
pub type TopoGraph = indexmap::IndexMap<String, Vec<String>>;

/// One metric sample from a running topology node.
#[derive(Debug, Clone)]
pub struct MetricSample {
    /// Flattened key, e.g. `source_demo_0_records_in_total`.
    pub key: String,
    pub value: serde_json::Value,
}

/// Metrics snapshot of a whole topology, preserving node order.
pub type TopoMetrics = Vec<MetricSample>;

/// A planned, runnable dataflow graph for one rule.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Begin execution. The returned receiver resolves at most once, when
    /// the topology terminates on its own:
    /// - `Some(err)` with a non-EOF [`RuleError`]: an internal,
    ///   non-recoverable error,
    /// - `Some(RuleError::Eof)`: all finite sources are exhausted,
    /// - `None` (or a closed channel): the topology was cancelled.
    ///
    /// Calling `open` twice is a contract violation.
    async fn open(&self) -> oneshot::Receiver<Option<RuleError>>;

    /// Tear the topology down and wait for all node tasks to exit.
    /// Idempotent; safe to call from the controller and from the
    /// completion watcher concurrently.
    async fn cancel(&self);

    /// Keys of all metric samples the topology exposes, in node order.
    fn metric_keys(&self) -> Vec<String>;

    /// Current metric samples. Same order as [`metric_keys`](Self::metric_keys).
    fn metrics(&self) -> TopoMetrics;

    /// Deregister the topology's metrics from any shared collector.
    /// Called exactly once, on rule deletion.
    fn remove_metrics(&self);

    /// The planned graph shape, for status reporting.
    fn graph(&self) -> TopoGraph;

    /// Names of the source streams the topology reads.
    fn streams(&self) -> Vec<String>;

    /// Inferred schema of the sink output, when the planner derived one.
    fn sink_schema(&self) -> Option<serde_json::Value>;

    /// Rewind one source stream to a caller-supplied offset.
    async fn reset_stream_offset(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<(), RuleError>;
}

/// Compiles a rule definition into a runnable [`Topology`].
#[async_trait]
pub trait Planner: Send + Sync {
    /// Validate and plan. Must not start execution and must be
    /// side-effect free on failure.
    async fn plan(&self, rule: &Rule) -> Result<Box<dyn Topology>, RuleError>;
}

/// Persists the `triggered` flag when a rule finishes of its own accord,
/// so a finite rule that ran to EOF does not restart on process boot.
#[async_trait]
pub trait TriggerUpdater: Send + Sync {
    async fn update_trigger(&self, rule_id: &str, triggered: bool);
}

/// No-op updater for deployments without persistent rule storage.
pub struct NullTriggerUpdater;

#[async_trait]
impl TriggerUpdater for NullTriggerUpdater {
    async fn update_trigger(&self, _rule_id: &str, _triggered: bool) {}
}
