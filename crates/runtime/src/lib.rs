//! Rule lifecycle runtime.
//!
//! Each rule gets one [`RuleController`] that binds the definition to a
//! live [`Topology`] and drives it through a concurrency-safe
//! [`StateMachine`]: user commands, crash recovery, and cron-based
//! schedule windows all funnel through the same transition table, so no
//! two state changes ever interleave for the same rule.
//!
//! The SQL planner, the dataflow runtime, and rule persistence are
//! external collaborators consumed through narrow traits ([`Planner`],
//! [`Topology`], a trigger-update callback).

pub mod cron;
pub mod error;
pub mod machine;
pub mod registry;
pub mod state;
pub mod topology;

pub use cron::{CronDispatcher, CronJob, EntryId, MockCron, TokioCron};
pub use error::RuleError;
pub use machine::{ActionSignal, RunState, StateMachine};
pub use registry::RuleRegistry;
pub use state::RuleController;
pub use topology::{
    MetricSample, NullTriggerUpdater, Planner, TopoGraph, TopoMetrics, Topology, TriggerUpdater,
};
