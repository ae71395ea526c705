// src/engine/runtime.rs

//! Runtime event loop driving one run of a DAG.
//!
//! The runtime owns the live nodes and the scheduler, dispatches ready
//! nodes to worker tasks up to `max_active_runs`, paces admissions with
//! `delay_between_steps`, and reacts to three kinds of events: worker
//! completions, external cancel intents, and the SIGKILL escalation timer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::dag::{Dag, Step};
use crate::engine::report::RunReporter;
use crate::engine::scheduler::{RunStatus, Scheduler};
use crate::exec::condition::{evaluate_conditions, ConditionOutcome};
use crate::exec::expand::{interpolate, RunEnv};
use crate::exec::node::SignalKind;
use crate::exec::runner::{execute_node, run_node};
use crate::exec::{Node, NodeStatus};

/// Identity and paths for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub dag_name: String,
    pub request_id: String,
    pub log_dir: PathBuf,
    pub params: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Events consumed by the runtime loop.
///
/// - workers send `NodeFinished`
/// - the signal bridge (IPC, Ctrl-C) sends `CancelRequested`
/// - the escalation timer sends `EscalateKill`
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    NodeFinished { name: String, status: NodeStatus },
    CancelRequested,
    EscalateKill,
}

/// The main orchestration runtime for a single run.
pub struct Runtime {
    dag: Arc<Dag>,
    ctx: Arc<RunContext>,
    nodes: Vec<Arc<Node>>,
    scheduler: Scheduler,
    env: RunEnv,
    events_tx: mpsc::Sender<RuntimeEvent>,
    events_rx: mpsc::Receiver<RuntimeEvent>,
    cancel_tx: watch::Sender<bool>,
    reporter: Arc<RunReporter>,
    dispatched_any: bool,
}

impl Runtime {
    pub fn new(dag: Arc<Dag>, ctx: RunContext) -> Self {
        let nodes: Vec<Arc<Node>> = dag
            .steps
            .iter()
            .map(|step| Arc::new(Node::new(step.clone())))
            .collect();
        let scheduler = Scheduler::new(&dag);
        let (events_tx, events_rx) = mpsc::channel::<RuntimeEvent>(64);
        let (cancel_tx, _) = watch::channel(false);
        let reporter = Arc::new(RunReporter::new(&ctx, nodes.clone()));

        Self {
            dag,
            ctx: Arc::new(ctx),
            nodes,
            scheduler,
            env: RunEnv::new(),
            events_tx,
            events_rx,
            cancel_tx,
            reporter,
            dispatched_any: false,
        }
    }

    /// Sender the signal bridge uses to deliver cancel intents.
    pub fn events_sender(&self) -> mpsc::Sender<RuntimeEvent> {
        self.events_tx.clone()
    }

    pub fn reporter(&self) -> Arc<RunReporter> {
        self.reporter.clone()
    }

    /// Drive the run to completion and return the aggregate status.
    pub async fn run(mut self) -> Result<RunStatus> {
        info!(
            dag = %self.dag.name,
            request_id = %self.ctx.request_id,
            "run started"
        );

        self.seed_environment().await?;

        match evaluate_conditions(&self.dag.preconditions, &self.env).await {
            Ok(ConditionOutcome::Met) => {}
            Ok(ConditionOutcome::Unmet {
                condition, actual, ..
            }) => {
                info!(
                    dag = %self.dag.name,
                    condition = %condition,
                    actual = %actual,
                    "run precondition unmet; skipping run"
                );
                self.reporter.mark_finished(RunStatus::Skipped);
                return Ok(RunStatus::Skipped);
            }
            Err(err) => {
                warn!(dag = %self.dag.name, error = %format!("{err:#}"), "run precondition failed to launch");
                self.reporter.mark_finished(RunStatus::Error);
                return Ok(RunStatus::Error);
            }
        }

        self.dispatch_ready().await;

        while !self.scheduler.all_terminal() {
            let event = match self.events_rx.recv().await {
                Some(event) => event,
                None => break,
            };
            debug!(?event, "runtime received event");

            match event {
                RuntimeEvent::NodeFinished { name, status } => {
                    self.scheduler.record_terminal(&name, status);
                    self.apply_forced_skips();
                    self.dispatch_ready().await;
                }
                RuntimeEvent::CancelRequested => self.handle_cancel(),
                RuntimeEvent::EscalateKill => {
                    for node in &self.nodes {
                        node.kill();
                    }
                }
            }
        }

        let status = self.scheduler.run_status();
        info!(
            dag = %self.dag.name,
            request_id = %self.ctx.request_id,
            status = %status,
            "run finished"
        );
        self.reporter.set_status(status);

        self.fire_handlers(status).await;
        self.reporter.mark_finished(status);

        Ok(status)
    }

    /// Apply run parameters and DAG-level environment bindings.
    ///
    /// Positional parameters become `$1, $2, …`; DAG env values are
    /// interpolated once here, so they can reference the parameters.
    async fn seed_environment(&self) -> Result<()> {
        for (i, value) in self.dag.params.positional.iter().enumerate() {
            self.env.set((i + 1).to_string(), value.clone());
        }
        for (key, value) in &self.dag.params.named {
            self.env.set(key.clone(), value.clone());
        }
        for (key, value) in &self.dag.env {
            let value = interpolate(value, &self.env).await?;
            self.env.set(key.clone(), value);
        }
        Ok(())
    }

    /// Launch ready nodes up to the concurrency cap, pacing consecutive
    /// dispatches with `delay_between_steps`.
    async fn dispatch_ready(&mut self) {
        if self.scheduler.is_canceled() {
            return;
        }

        let slots = self
            .dag
            .max_active_runs
            .saturating_sub(self.scheduler.running_count());

        let ready: Vec<String> = self.scheduler.ready().into_iter().take(slots).collect();
        for name in ready {
            if self.dispatched_any && !self.dag.delay_between_steps.is_zero() {
                tokio::time::sleep(self.dag.delay_between_steps).await;
            }
            self.dispatched_any = true;

            let node = match self.node(&name) {
                Some(node) => node.clone(),
                None => continue,
            };

            info!(step = %name, "dispatching step");
            self.scheduler.mark_running(&name);
            tokio::spawn(run_node(
                node,
                self.ctx.clone(),
                self.env.clone(),
                self.cancel_tx.subscribe(),
                self.events_tx.clone(),
            ));
        }
    }

    /// Publish forced-Skipped decisions to the live nodes.
    fn apply_forced_skips(&mut self) {
        for name in self.scheduler.collect_forced_skips() {
            if let Some(node) = self.node(&name) {
                info!(step = %name, "upstream outcome forces skip");
                node.mark_skipped();
            }
        }
    }

    /// First cancel intent wins; duplicates coalesce into a no-op.
    fn handle_cancel(&mut self) {
        if self.scheduler.is_canceled() {
            return;
        }
        info!(dag = %self.dag.name, "cancel requested; signalling running steps");

        self.scheduler.mark_canceled();
        let _ = self.cancel_tx.send(true);

        for node in &self.nodes {
            node.signal(SignalKind::Term);
            node.cancel();
        }
        self.apply_forced_skips();

        // Escalate whatever is still alive once the cleanup window closes.
        let events_tx = self.events_tx.clone();
        let cleanup = self.dag.max_cleanup_time;
        tokio::spawn(async move {
            tokio::time::sleep(cleanup).await;
            let _ = events_tx.send(RuntimeEvent::EscalateKill).await;
        });
    }

    /// Fire the status-specific handler, then `exit`, through the ordinary
    /// executor path. Handler outcomes never alter the computed run status.
    async fn fire_handlers(&mut self, status: RunStatus) {
        let specific = match status {
            RunStatus::Success => self.dag.handlers.success.clone(),
            RunStatus::Error => self.dag.handlers.failure.clone(),
            RunStatus::Canceled => self.dag.handlers.cancel.clone(),
            RunStatus::Skipped | RunStatus::Running => None,
        };

        for step in specific.into_iter().chain(self.dag.handlers.exit.clone()) {
            self.run_handler(&step).await;
        }
    }

    async fn run_handler(&self, step: &Step) {
        info!(handler = %step.name, "firing lifecycle handler");
        let node = Arc::new(Node::new(step.clone()));
        self.reporter.add_handler(node.clone());

        // Handlers are not subject to the run's cancel flag; the cancel
        // handler in particular runs after cancellation.
        let (_guard_tx, cancel_rx) = watch::channel(false);
        let status = execute_node(node, self.ctx.clone(), self.env.clone(), cancel_rx).await;

        if status == NodeStatus::Error {
            warn!(handler = %step.name, "lifecycle handler failed");
        }
    }

    fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name() == name)
    }
}
