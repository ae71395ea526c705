// src/exec/runner.rs

//! Worker-side driver for one node.
//!
//! Applies the step's policies in order: preconditions gate the attempt,
//! the retry policy re-enters Running on failure, and the repeat policy
//! re-enters Running after any terminal status. Retries nest inside
//! repeats. Every attempt allocates fresh files and tears them down on
//! every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::engine::runtime::{RunContext, RuntimeEvent};
use crate::exec::condition::{evaluate_conditions, ConditionOutcome};
use crate::exec::expand::RunEnv;
use crate::exec::node::{ExecResult, Node, NodeStatus};

/// Run a node to its terminal status and report it to the runtime.
///
/// This is the entry point the runtime spawns one worker task per node
/// with; completions flow back as [`RuntimeEvent::NodeFinished`].
pub async fn run_node(
    node: Arc<Node>,
    ctx: Arc<RunContext>,
    env: RunEnv,
    cancel_rx: watch::Receiver<bool>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) {
    let status = execute_node(node.clone(), ctx, env, cancel_rx).await;
    let _ = runtime_tx
        .send(RuntimeEvent::NodeFinished {
            name: node.name().to_string(),
            status,
        })
        .await;
}

/// Drive a node through repeat cycles until it settles on a final status.
///
/// Used directly (without the completion event) for handler steps.
pub async fn execute_node(
    node: Arc<Node>,
    ctx: Arc<RunContext>,
    env: RunEnv,
    mut cancel_rx: watch::Receiver<bool>,
) -> NodeStatus {
    loop {
        let status = run_cycle(&node, &ctx, &env, &mut cancel_rx).await;

        if node.step.repeat.repeat && status != NodeStatus::Canceled {
            let interval = Duration::from_secs(node.step.repeat.interval_sec);
            if wait_or_canceled(&mut cancel_rx, interval).await {
                node.set_status(NodeStatus::Canceled);
                return NodeStatus::Canceled;
            }
            node.inc_done();
            info!(step = %node.name(), done_count = node.snapshot().done_count, "repeating step");
            continue;
        }

        return status;
    }
}

/// One cycle: precondition gate, then attempts under the retry policy.
async fn run_cycle(
    node: &Arc<Node>,
    ctx: &Arc<RunContext>,
    env: &RunEnv,
    cancel_rx: &mut watch::Receiver<bool>,
) -> NodeStatus {
    loop {
        if *cancel_rx.borrow() {
            node.mark_finished(NodeStatus::Canceled, None);
            return NodeStatus::Canceled;
        }

        match evaluate_conditions(&node.step.preconditions, env).await {
            Ok(ConditionOutcome::Met) => {}
            Ok(ConditionOutcome::Unmet {
                condition,
                expected,
                actual,
            }) => {
                info!(
                    step = %node.name(),
                    condition = %condition,
                    expected = %expected,
                    actual = %actual,
                    "precondition unmet; skipping step"
                );
                node.mark_skipped();
                return NodeStatus::Skipped;
            }
            Err(err) => {
                node.mark_finished(NodeStatus::Error, Some(format!("{err:#}")));
                return NodeStatus::Error;
            }
        }

        let files = match node.prepare(&ctx.log_dir, &ctx.request_id) {
            Ok(files) => files,
            Err(err) => {
                // Setup failures are terminal; the retry policy only covers
                // child execution.
                node.mark_finished(NodeStatus::Error, Some(format!("{err:#}")));
                return NodeStatus::Error;
            }
        };

        let result = node.execute(&files, env).await;
        node.teardown(files);

        let status = match result {
            Ok(ExecResult::Success) => {
                node.mark_finished(NodeStatus::Success, None);
                NodeStatus::Success
            }
            Ok(ExecResult::Canceled) => {
                node.mark_finished(NodeStatus::Canceled, None);
                return NodeStatus::Canceled;
            }
            Ok(ExecResult::Failed(message)) => {
                node.mark_finished(NodeStatus::Error, Some(message));
                NodeStatus::Error
            }
            Err(err) => {
                // Spawn failures are terminal as well.
                node.mark_finished(NodeStatus::Error, Some(format!("{err:#}")));
                return NodeStatus::Error;
            }
        };

        if status == NodeStatus::Error && node.retry_count() < node.step.retry.limit {
            let interval = Duration::from_secs(node.step.retry.interval_sec);
            if wait_or_canceled(cancel_rx, interval).await {
                node.set_status(NodeStatus::Canceled);
                return NodeStatus::Canceled;
            }
            node.inc_retry();
            warn!(
                step = %node.name(),
                retry_count = node.retry_count(),
                limit = node.step.retry.limit,
                "step failed; retrying"
            );
            continue;
        }

        return status;
    }
}

/// Sleep for `dur`, returning early with `true` when the run is canceled.
async fn wait_or_canceled(cancel_rx: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    if *cancel_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        canceled = async { cancel_rx.wait_for(|canceled| *canceled).await.is_ok() } => {
            if canceled {
                true
            } else {
                // Sender gone; nothing can cancel us any more.
                tokio::time::sleep(dur).await;
                false
            }
        },
    }
}
