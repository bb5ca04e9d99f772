//! Rule run-state machine.
//!
//! A pure, lock-protected finite automaton. Given the current state and an
//! incoming action it decides between transitioning immediately, ignoring
//! the action as a no-op, and deferring it to the action queue. All
//! start/stop intent, manual or scheduler-driven, goes through
//! [`StateMachine::trigger_action`] under one lock, so a concurrent
//! external start and a scheduler start can never both proceed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;

use serde::Serialize;
use tracing::{debug, warn};

// ── Vocabulary ──────────────────────────────────────────────────────

/// Run state of a rule. Exactly one value holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Stopped but armed for the scheduler; not equivalent to `Stopped`.
    ScheduledStop,
    StoppedByErr,
}

impl RunState {
    /// External status name, stable for API compatibility.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::ScheduledStop => "stopped: waiting for next schedule.",
            RunState::StoppedByErr => "stopped by error",
        }
    }

    /// A settled state: the queue may drain once one of these is reached.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            RunState::Running
                | RunState::Stopped
                | RunState::StoppedByErr
                | RunState::ScheduledStop
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intent to change a rule's run state. Never a state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSignal {
    Start,
    Stop,
    ScheduledStart,
    ScheduledStop,
}

impl fmt::Display for ActionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionSignal::Start => "start",
            ActionSignal::Stop => "stop",
            ActionSignal::ScheduledStart => "scheduledStart",
            ActionSignal::ScheduledStop => "scheduledStop",
        };
        f.write_str(s)
    }
}

/// What to do with a signal against a given state, per the transition
/// table.
enum Decision {
    Ignore,
    Defer,
    Transition(RunState),
}

fn decide(current: RunState, signal: ActionSignal) -> Decision {
    use RunState::*;
    match signal {
        ActionSignal::Start => match current {
            Stopped | StoppedByErr => Decision::Transition(Starting),
            Starting | Running | ScheduledStop => Decision::Ignore,
            Stopping => Decision::Defer,
        },
        ActionSignal::Stop => match current {
            Running | ScheduledStop => Decision::Transition(Stopping),
            Stopped | StoppedByErr => Decision::Ignore,
            Starting | Stopping => Decision::Defer,
        },
        ActionSignal::ScheduledStart => match current {
            Stopped | StoppedByErr | ScheduledStop => Decision::Transition(Starting),
            Starting | Running => Decision::Ignore,
            Stopping => Decision::Defer,
        },
        ActionSignal::ScheduledStop => match current {
            Running => Decision::Transition(Stopping),
            Stopped | StoppedByErr | ScheduledStop => Decision::Ignore,
            Starting | Stopping => Decision::Defer,
        },
    }
}

// ── State machine ───────────────────────────────────────────────────

struct MachineInner {
    current: RunState,
    action_q: VecDeque<ActionSignal>,
    last_will: String,
    last_start_ms: i64,
    last_stop_ms: i64,
}

/// Lock-protected automaton owning the run state and the action queue.
pub struct StateMachine {
    rule_id: String,
    inner: RwLock<MachineInner>,
}

impl StateMachine {
    pub fn new(rule_id: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            inner: RwLock::new(MachineInner {
                current: RunState::Stopped,
                action_q: VecDeque::new(),
                last_will: String::new(),
                last_start_ms: 0,
                last_stop_ms: 0,
            }),
        }
    }

    /// Decide how to handle `signal` against the current state.
    ///
    /// Returns `true` when the caller must do nothing further: the signal
    /// was a no-op for the current state, or was appended to the queue to
    /// apply after the in-flight transition settles. Returns `false` when
    /// the caller must perform the real work now and report the outcome
    /// via [`transit`](Self::transit).
    pub fn trigger_action(&self, signal: ActionSignal) -> bool {
        let mut inner = self.write();
        // A non-empty queue means a transition is in flight: everything
        // defers, and consecutive identical signals collapse into one.
        if let Some(last) = inner.action_q.back() {
            if *last == signal {
                debug!(rule_id = %self.rule_id, %signal, "ignoring duplicate queued action");
            } else {
                debug!(rule_id = %self.rule_id, %signal, "deferring action to queue");
                inner.action_q.push_back(signal);
            }
            return true;
        }
        match decide(inner.current, signal) {
            Decision::Transition(next) => {
                inner.current = next;
                false
            }
            Decision::Ignore => {
                debug!(
                    rule_id = %self.rule_id,
                    %signal,
                    state = %inner.current,
                    "ignoring action for current state"
                );
                true
            }
            Decision::Defer => {
                debug!(
                    rule_id = %self.rule_id,
                    %signal,
                    state = %inner.current,
                    "deferring action until transition settles"
                );
                inner.action_q.push_back(signal);
                true
            }
        }
    }

    /// Apply a signal dequeued by the drain loop against the settled
    /// state. Unlike [`trigger_action`](Self::trigger_action) this never
    /// re-queues; drains only run from settled states, where no signal
    /// defers.
    pub(crate) fn apply_popped(&self, signal: ActionSignal) -> bool {
        let mut inner = self.write();
        match decide(inner.current, signal) {
            Decision::Transition(next) => {
                inner.current = next;
                false
            }
            Decision::Ignore => true,
            Decision::Defer => {
                warn!(
                    rule_id = %self.rule_id,
                    %signal,
                    state = %inner.current,
                    "dropping drained action against unsettled state"
                );
                true
            }
        }
    }

    /// Record the outcome of work started by a `trigger_action` that
    /// returned `false`.
    ///
    /// Stamps the run-timing fields and the last will. Returns `true`
    /// when the new state is settled, telling the caller to drain the
    /// queue (the "chain action").
    pub fn transit(&self, new_state: RunState, last_will: Option<String>) -> bool {
        let mut inner = self.write();
        inner.current = new_state;
        if let Some(will) = last_will {
            inner.last_will = will;
        }
        match new_state {
            RunState::Running => {
                inner.last_start_ms = edgeflow_core::now_ms();
                inner.last_will.clear();
            }
            RunState::Stopped | RunState::StoppedByErr | RunState::ScheduledStop => {
                inner.last_stop_ms = edgeflow_core::now_ms();
            }
            RunState::Starting | RunState::Stopping => {}
        }
        debug!(rule_id = %self.rule_id, state = %new_state, "transited");
        new_state.is_settled()
    }

    /// FIFO dequeue of the next deferred action.
    pub fn pop_action(&self) -> Option<ActionSignal> {
        self.write().action_q.pop_front()
    }

    pub fn current_state(&self) -> RunState {
        self.read().current
    }

    pub fn last_will(&self) -> String {
        self.read().last_will.clone()
    }

    pub fn last_start_ms(&self) -> i64 {
        self.read().last_start_ms
    }

    pub fn last_stop_ms(&self) -> i64 {
        self.read().last_stop_ms
    }

    pub fn queued_len(&self) -> usize {
        self.read().action_q.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MachineInner> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MachineInner> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
