// src/engine/scheduler.rs

//! Ready-set state machine over the node set.
//!
//! The scheduler holds a status mirror for every step and answers three
//! questions for the runtime:
//! - which steps may be launched now (`ready`, in declared step order)
//! - which steps must be forced to Skipped because an ancestor ended
//!   non-Success without a permitting `continueOn` (`collect_forced_skips`)
//! - what the aggregate run status is once everything is terminal
//!   (`run_status`)
//!
//! It never touches processes or node locks; the runtime applies its
//! decisions to the live nodes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::model::ContinueOn;
use crate::dag::{Dag, DagGraph};
use crate::exec::NodeStatus;

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "finished")]
    Success,
    #[serde(rename = "failed")]
    Error,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "skipped")]
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "finished",
            RunStatus::Error => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Per-run scheduling state, decoupled from the live nodes.
#[derive(Debug)]
pub struct Scheduler {
    graph: DagGraph,
    /// Declared step order; admission ties break in this order.
    order: Vec<String>,
    continue_on: HashMap<String, ContinueOn>,
    statuses: HashMap<String, NodeStatus>,
    canceled: bool,
}

/// Whether a step with all dependencies terminal may run.
enum EdgeDecision {
    /// At least one dependency is not terminal yet.
    Undecided,
    MayRun,
    ForceSkip,
}

impl Scheduler {
    pub fn new(dag: &Dag) -> Self {
        let graph = DagGraph::from_steps(&dag.steps);
        let order: Vec<String> = dag.steps.iter().map(|s| s.name.clone()).collect();
        let continue_on = dag
            .steps
            .iter()
            .map(|s| (s.name.clone(), s.continue_on))
            .collect();
        let statuses = order
            .iter()
            .map(|name| (name.clone(), NodeStatus::None))
            .collect();

        Self {
            graph,
            order,
            continue_on,
            statuses,
            canceled: false,
        }
    }

    /// Stop admitting new nodes. Already-running nodes are signalled by the
    /// runtime; this only affects scheduling decisions.
    pub fn mark_canceled(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn mark_running(&mut self, name: &str) {
        self.statuses.insert(name.to_string(), NodeStatus::Running);
    }

    pub fn record_terminal(&mut self, name: &str, status: NodeStatus) {
        debug!(step = %name, status = %status, "recording terminal status");
        self.statuses.insert(name.to_string(), status);
    }

    pub fn status_of(&self, name: &str) -> NodeStatus {
        self.statuses
            .get(name)
            .copied()
            .unwrap_or(NodeStatus::None)
    }

    pub fn running_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| **s == NodeStatus::Running)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.statuses.values().all(|s| s.is_terminal())
    }

    /// Steps that may be launched now, in declared order. Empty after a
    /// cancel.
    pub fn ready(&self) -> Vec<String> {
        if self.canceled {
            return Vec::new();
        }
        self.order
            .iter()
            .filter(|name| {
                self.status_of(name) == NodeStatus::None
                    && matches!(self.edge_decision(name), EdgeDecision::MayRun)
            })
            .cloned()
            .collect()
    }

    /// Mark every step whose propagated decision is "may not run" as
    /// Skipped, cascading transitively, and return the newly skipped names.
    ///
    /// After a cancel this sweeps up every step that never started.
    pub fn collect_forced_skips(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();

        loop {
            let candidates: Vec<String> = self
                .order
                .iter()
                .filter(|name| {
                    self.status_of(name) == NodeStatus::None
                        && (self.canceled
                            || matches!(self.edge_decision(name), EdgeDecision::ForceSkip))
                })
                .cloned()
                .collect();

            if candidates.is_empty() {
                break;
            }

            for name in candidates {
                debug!(step = %name, "forcing step to skipped");
                self.statuses.insert(name.clone(), NodeStatus::Skipped);
                skipped.push(name);
            }
        }

        skipped
    }

    /// Aggregate run status, valid once `all_terminal` holds:
    /// Canceled > Error > all-Skipped > Success.
    pub fn run_status(&self) -> RunStatus {
        let mut any_error = false;
        let mut all_skipped = !self.statuses.is_empty();

        for status in self.statuses.values() {
            match status {
                NodeStatus::Canceled => return RunStatus::Canceled,
                NodeStatus::Error => any_error = true,
                _ => {}
            }
            if *status != NodeStatus::Skipped {
                all_skipped = false;
            }
        }

        if any_error {
            RunStatus::Error
        } else if all_skipped {
            RunStatus::Skipped
        } else {
            RunStatus::Success
        }
    }

    /// Decide whether `name` may run based on its incoming edges.
    ///
    /// An edge from a Success dependency is satisfied; Error/Canceled needs
    /// the child's `continueOn.failure`; Skipped needs
    /// `continueOn.skipped`.
    fn edge_decision(&self, name: &str) -> EdgeDecision {
        let continue_on = self
            .continue_on
            .get(name)
            .copied()
            .unwrap_or_default();

        let mut decision = EdgeDecision::MayRun;
        for dep in self.graph.dependencies_of(name) {
            match self.status_of(dep) {
                NodeStatus::None | NodeStatus::Running => return EdgeDecision::Undecided,
                NodeStatus::Success => {}
                NodeStatus::Error | NodeStatus::Canceled => {
                    if !continue_on.failure {
                        decision = EdgeDecision::ForceSkip;
                    }
                }
                NodeStatus::Skipped => {
                    if !continue_on.skipped {
                        decision = EdgeDecision::ForceSkip;
                    }
                }
            }
        }

        decision
    }
}
