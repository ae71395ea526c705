// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod history;
pub mod ipc;
pub mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::{CliArgs, Command};
use crate::config::load_and_validate;
use crate::dag::Dag;
use crate::engine::{RunContext, RunSnapshot, RunStatus, Runtime, RuntimeEvent, Scheduler};
use crate::ipc::IpcServer;

/// High-level entry point used by `main.rs`.
///
/// Dispatches the parsed CLI command and returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    match args.command {
        Command::Start { params, file } => start(&file, params.as_deref(), None).await,
        Command::Stop { file } => stop(&file).await,
        Command::Status { file } => status(&file).await,
        Command::Retry { req, file } => retry(&file, &req).await,
        Command::Dry { params, file } => dry(&file, params.as_deref()),
    }
}

/// Exit code for a finished run: 0 Success, 1 Error, 130 Canceled,
/// 3 Skipped.
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => 0,
        RunStatus::Error => 1,
        RunStatus::Canceled => 130,
        RunStatus::Skipped => 3,
        RunStatus::Running => 1,
    }
}

/// Run the DAG once, wiring up the IPC socket and Ctrl-C handling.
///
/// `request_id_override` is used by `retry` to re-run under the prior
/// request id.
async fn start(
    file: &str,
    params: Option<&str>,
    request_id_override: Option<String>,
) -> Result<i32> {
    let path = PathBuf::from(file);
    let cfg = load_and_validate(&path)?;
    let dag = Arc::new(Dag::from_file(cfg, &path, params));

    let request_id =
        request_id_override.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let ctx = RunContext {
        dag_name: dag.name.clone(),
        request_id,
        log_dir: dag.log_dir.clone(),
        params: dag.params.raw.clone(),
        started_at: Utc::now(),
    };

    let runtime = Runtime::new(dag.clone(), ctx);
    let reporter = runtime.reporter();
    let events_tx = runtime.events_sender();

    // Per-run IPC socket for the supervisor's stop/status requests.
    let sock = ipc::socket_path(&path);
    let server = IpcServer::bind(&sock)?;
    let (sock_path, server_handle) = server.spawn(reporter.clone(), events_tx.clone());

    // Ctrl-C → graceful cancel.
    {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {err}");
                return;
            }
            let _ = events_tx.send(RuntimeEvent::CancelRequested).await;
        });
    }

    let status = runtime.run().await?;

    server_handle.abort();
    IpcServer::close(&sock_path);

    let snapshot = reporter.snapshot();
    let dir = history::history_dir(&dag.data_dir, &dag.name);
    if let Err(err) = history::write_snapshot(&dir, &snapshot) {
        warn!(error = %format!("{err:#}"), "failed to write run history");
    }

    print_snapshot(&snapshot);
    Ok(exit_code(status))
}

/// Deliver a cancel intent to the live run of `file`.
async fn stop(file: &str) -> Result<i32> {
    let path = PathBuf::from(file);
    ipc::send_cancel(&path).await?;
    println!("cancel delivered to the live run of {file}");
    Ok(0)
}

/// Print the current run snapshot: the live one when a run is up, the
/// most recent history entry otherwise.
async fn status(file: &str) -> Result<i32> {
    let path = PathBuf::from(file);

    if let Ok(snapshot) = ipc::fetch_status(&path).await {
        print_snapshot(&snapshot);
        return Ok(0);
    }

    let cfg = load_and_validate(&path)?;
    let dag = Dag::from_file(cfg, &path, None);
    let dir = history::history_dir(&dag.data_dir, &dag.name);
    match history::latest_snapshot(&dir)? {
        Some(snapshot) => {
            print_snapshot(&snapshot);
            Ok(0)
        }
        None => {
            println!("no run recorded for {file}");
            Ok(0)
        }
    }
}

/// Re-run with the parameters and request id of a previous run.
async fn retry(file: &str, request_id: &str) -> Result<i32> {
    let path = PathBuf::from(file);
    let cfg = load_and_validate(&path)?;
    let dag = Dag::from_file(cfg, &path, None);

    let dir = history::history_dir(&dag.data_dir, &dag.name);
    let previous = history::read_snapshot(&dir, request_id)?;

    info!(
        request_id = %request_id,
        params = ?previous.params,
        "retrying previous run"
    );
    start(
        file,
        previous.params.as_deref(),
        Some(previous.request_id.clone()),
    )
    .await
}

/// Walk the DAG in admission order and report what would run; no child
/// processes are spawned.
fn dry(file: &str, params: Option<&str>) -> Result<i32> {
    let path = PathBuf::from(file);
    let cfg = load_and_validate(&path)?;
    let dag = Dag::from_file(cfg, &path, params);

    println!("dagu dry-run: {}", dag.name);
    if let Some(description) = &dag.description {
        println!("  {description}");
    }
    println!("  max_active_runs: {}", dag.max_active_runs);
    println!("  log_dir: {}", dag.log_dir.display());
    println!();

    // Simulate a run where every step succeeds; the resulting admission
    // order is the order a real run would use.
    let mut scheduler = Scheduler::new(&dag);
    let mut position = 1;
    println!("steps ({}):", dag.steps.len());
    while !scheduler.all_terminal() {
        let batch = scheduler.ready();
        if batch.is_empty() {
            break;
        }
        for name in batch {
            scheduler.mark_running(&name);
            scheduler.record_terminal(&name, crate::exec::NodeStatus::Success);

            let step = match dag.step(&name) {
                Some(step) => step,
                None => continue,
            };
            println!("  {position}. {name}");
            if !step.depends.is_empty() {
                println!("      depends: {:?}", step.depends);
            }
            if let Some(command) = &step.command {
                println!("      command: {command}");
            }
            if step.script.is_some() {
                println!("      script: (inline)");
            }
            if !step.preconditions.is_empty() {
                println!("      preconditions: {}", step.preconditions.len());
            }
            position += 1;
        }
    }

    Ok(0)
}

fn print_snapshot(snapshot: &RunSnapshot) {
    println!(
        "{} (request {}): {}",
        snapshot.name, snapshot.request_id, snapshot.status
    );
    for node in &snapshot.nodes {
        print_node_line(node);
    }
    for node in &snapshot.handlers {
        print_node_line(node);
    }
}

fn print_node_line(node: &crate::engine::NodeSnapshot) {
    let mut line = format!("  {:<24} {}", node.name, node.status);
    if node.retry_count > 0 {
        line.push_str(&format!(" (retries: {})", node.retry_count));
    }
    if let Some(err) = &node.last_error {
        line.push_str(&format!(" ({err})"));
    }
    println!("{line}");
}
