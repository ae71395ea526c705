// src/engine/report.rs

//! Run reporter: consistent snapshots of run + node state for external
//! observers (status CLI, IPC probes, history files).
//!
//! Callers never hold internal locks: a snapshot is assembled by reading
//! each node's state under its own lock, batched under the reporter's
//! run-level lock, and handed out as an immutable value.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::runtime::RunContext;
use crate::engine::scheduler::RunStatus;
use crate::exec::{Node, NodeStatus};

/// Immutable view of one node at a consistent moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub status: NodeStatus,
    pub log_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub retried_at: Option<DateTime<Utc>>,
    pub done_count: u32,
    pub last_error: Option<String>,
}

impl NodeSnapshot {
    fn from_node(node: &Node) -> Self {
        let state = node.snapshot();
        Self {
            name: node.name().to_string(),
            status: state.status,
            log_path: state.log_path,
            started_at: state.started_at,
            finished_at: state.finished_at,
            retry_count: state.retry_count,
            retried_at: state.retried_at,
            done_count: state.done_count,
            last_error: state.last_error,
        }
    }
}

/// Immutable view of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub name: String,
    pub request_id: String,
    pub params: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_dir: PathBuf,
    pub nodes: Vec<NodeSnapshot>,
    /// Handler nodes that ran (success/failure/cancel/exit), in fire order.
    #[serde(default)]
    pub handlers: Vec<NodeSnapshot>,
}

/// Shared run state readable while the runtime drives the nodes.
#[derive(Debug)]
pub struct RunReporter {
    dag_name: String,
    request_id: String,
    params: Option<String>,
    log_dir: PathBuf,
    started_at: DateTime<Utc>,
    status: RwLock<RunStatus>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    nodes: Vec<Arc<Node>>,
    handlers: RwLock<Vec<Arc<Node>>>,
}

impl RunReporter {
    pub fn new(ctx: &RunContext, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            dag_name: ctx.dag_name.clone(),
            request_id: ctx.request_id.clone(),
            params: ctx.params.clone(),
            log_dir: ctx.log_dir.clone(),
            started_at: ctx.started_at,
            status: RwLock::new(RunStatus::Running),
            finished_at: RwLock::new(None),
            nodes,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read().unwrap()
    }

    pub(crate) fn set_status(&self, status: RunStatus) {
        *self.status.write().unwrap() = status;
    }

    pub(crate) fn mark_finished(&self, status: RunStatus) {
        *self.status.write().unwrap() = status;
        *self.finished_at.write().unwrap() = Some(Utc::now());
    }

    pub(crate) fn add_handler(&self, node: Arc<Node>) {
        self.handlers.write().unwrap().push(node);
    }

    /// Capture the run and every node at a consistent moment.
    pub fn snapshot(&self) -> RunSnapshot {
        let status = self.status.read().unwrap();
        let finished_at = self.finished_at.read().unwrap();
        let handlers = self.handlers.read().unwrap();

        RunSnapshot {
            name: self.dag_name.clone(),
            request_id: self.request_id.clone(),
            params: self.params.clone(),
            status: *status,
            started_at: self.started_at,
            finished_at: *finished_at,
            log_dir: self.log_dir.clone(),
            nodes: self.nodes.iter().map(|n| NodeSnapshot::from_node(n)).collect(),
            handlers: handlers.iter().map(|n| NodeSnapshot::from_node(n)).collect(),
        }
    }
}
