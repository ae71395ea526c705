// src/exec/node.rs

//! Per-step execution: one [`Node`] owns a step's runtime state, its child
//! process, its log sinks and its cancel semantics.
//!
//! Status machine:
//!
//! ```text
//!  None ──setup──▶ Running ──exit 0──▶ Success
//!                    │       ──exit ≠0─▶ Error
//!                    │       ──cancel──▶ Canceled
//!                    └──precondition unmet──▶ Skipped
//! ```
//!
//! Retries re-enter Running with fresh files; repeats re-enter Running from
//! any terminal status. Both are driven by [`super::runner`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::dag::{CommandLine, Step};
use crate::errors::DaguError;
use crate::exec::expand::{expand_env, interpolate, split_command, RunEnv};

/// Status of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "not started")]
    None,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "failed")]
    Error,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "finished")]
    Success,
    #[serde(rename = "skipped")]
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Error | NodeStatus::Canceled | NodeStatus::Skipped
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::None => "not started",
            NodeStatus::Running => "running",
            NodeStatus::Error => "failed",
            NodeStatus::Canceled => "canceled",
            NodeStatus::Success => "finished",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Mutable per-run state of a node.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub status: NodeStatus,
    pub log_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub retried_at: Option<DateTime<Utc>>,
    pub done_count: u32,
    pub last_error: Option<String>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::None,
            log_path: None,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            retried_at: None,
            done_count: 0,
            last_error: None,
        }
    }
}

type SharedWriter = Arc<Mutex<BufWriter<File>>>;

/// Files allocated for one attempt; consumed exactly once by
/// [`Node::teardown`]. The temp script path deletes itself on drop, so the
/// file never outlives the attempt even on a panicking path.
pub(crate) struct AttemptFiles {
    log_path: PathBuf,
    log: SharedWriter,
    redirect: Option<SharedWriter>,
    script: Option<tempfile::TempPath>,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecResult {
    Success,
    Failed(String),
    Canceled,
}

/// A step plus its runtime state, shared between the worker that executes
/// it and the readers (reporter, signal bridge, runtime).
#[derive(Debug)]
pub struct Node {
    pub step: Step,
    state: RwLock<NodeState>,
    /// Pid of the live child, 0 when none. The child leads its own process
    /// group, so `-pid` addresses the whole subtree.
    pid: AtomicI32,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Node {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            state: RwLock::new(NodeState::default()),
            pid: AtomicI32::new(0),
            cancel_tx: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().unwrap().status
    }

    pub fn snapshot(&self) -> NodeState {
        self.state.read().unwrap().clone()
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        self.state.write().unwrap().status = status;
    }

    pub(crate) fn mark_finished(&self, status: NodeStatus, error: Option<String>) {
        let mut state = self.state.write().unwrap();
        state.status = status;
        state.finished_at = Some(Utc::now());
        if error.is_some() {
            state.last_error = error;
        }
    }

    /// Skip without ever having started; keeps `last_error` unset.
    pub(crate) fn mark_skipped(&self) {
        let mut state = self.state.write().unwrap();
        state.status = NodeStatus::Skipped;
        state.finished_at = Some(Utc::now());
    }

    pub(crate) fn inc_retry(&self) {
        let mut state = self.state.write().unwrap();
        state.retry_count += 1;
        state.retried_at = Some(Utc::now());
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.state.read().unwrap().retry_count
    }

    pub(crate) fn inc_done(&self) {
        self.state.write().unwrap().done_count += 1;
    }

    fn record_teardown_error(&self, message: String) {
        let mut state = self.state.write().unwrap();
        // A teardown failure must not mask the error that got us here.
        if state.last_error.is_none() {
            state.last_error = Some(message);
        }
    }

    /// Send `sig` to the node's process group and flip Running → Canceled.
    /// Idempotent; a node that is not Running is left untouched.
    pub fn signal(&self, sig: SignalKind) {
        let mut state = self.state.write().unwrap();
        if state.status != NodeStatus::Running {
            return;
        }
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            info!(step = %self.step.name, signal = ?sig, "signalling process group");
            kill_process_group(pid, sig);
        }
        state.status = NodeStatus::Canceled;
    }

    /// Fire the cancel trigger bound to the current spawn, if any, after
    /// flipping Running → Canceled. The child observes this as a standard
    /// termination path.
    pub fn cancel(&self) {
        {
            let mut state = self.state.write().unwrap();
            if state.status == NodeStatus::Running {
                state.status = NodeStatus::Canceled;
            }
        }
        if let Some(tx) = self.cancel_tx.lock().unwrap().take() {
            debug!(step = %self.step.name, "firing cancel trigger");
            let _ = tx.send(());
        }
    }

    /// Escalation path: SIGKILL the process group without touching status.
    pub fn kill(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            warn!(step = %self.step.name, "escalating to SIGKILL");
            kill_process_group(pid, SignalKind::Kill);
        }
    }

    /// Allocate the attempt's files and transition to Running.
    ///
    /// The log path is `{log_dir}/{sanitized_name}.{ts}.{req8}.log`; the
    /// stdout redirect resolves relative to the step's working directory;
    /// a non-empty script body lands in a fresh temp file under that
    /// directory.
    pub(crate) fn prepare(&self, log_dir: &Path, request_id: &str) -> Result<AttemptFiles> {
        // One clock read: the log-file stamp is derived from the same
        // instant recorded as started_at.
        let started = Utc::now();
        let stamp = started
            .with_timezone(&Local)
            .format("%Y%m%d.%H:%M:%S%.3f");
        let req8: String = request_id.chars().take(8).collect();
        let log_path = log_dir.join(format!(
            "{}.{}.{}.log",
            sanitize_filename(&self.step.name),
            stamp,
            req8
        ));

        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log directory {log_dir:?}"))?;
        let log_file = File::create(&log_path)
            .with_context(|| format!("creating log file {log_path:?}"))?;
        let log = Arc::new(Mutex::new(BufWriter::new(log_file)));

        let redirect = match &self.step.stdout {
            Some(path) => {
                let p = PathBuf::from(path);
                let p = if p.is_absolute() {
                    p
                } else {
                    self.step.dir.join(p)
                };
                let file = File::create(&p)
                    .with_context(|| format!("creating stdout redirect {p:?}"))?;
                Some(Arc::new(Mutex::new(BufWriter::new(file))))
            }
            None => None,
        };

        let script = match &self.step.script {
            Some(body) => {
                let mut file = tempfile::Builder::new()
                    .prefix("dagu_script-")
                    .tempfile_in(&self.step.dir)
                    .with_context(|| {
                        format!("creating script file under {:?}", self.step.dir)
                    })?;
                file.write_all(body.as_bytes())
                    .context("writing script body")?;
                file.flush().context("flushing script body")?;
                file.as_file().sync_all().context("syncing script file")?;
                Some(file.into_temp_path())
            }
            None => None,
        };

        {
            let mut state = self.state.write().unwrap();
            state.status = NodeStatus::Running;
            state.started_at = Some(started);
            state.finished_at = None;
            state.log_path = Some(log_path.clone());
        }

        Ok(AttemptFiles {
            log_path,
            log,
            redirect,
            script,
        })
    }

    /// Spawn the child and block until it terminates or the cancel trigger
    /// fires.
    ///
    /// stdout and stderr multiplex into the log writer; stdout is
    /// additionally tee'd into the redirect writer and, when `output` is
    /// declared, into a capture buffer whose trimmed contents land in the
    /// run environment once the attempt succeeds.
    pub(crate) async fn execute(&self, files: &AttemptFiles, env: &RunEnv) -> Result<ExecResult> {
        let (program, mut args) = self.resolve_command(files, env).await?;

        let mut step_env = Vec::with_capacity(self.step.env.len());
        for (key, value) in &self.step.env {
            step_env.push((key.clone(), interpolate(value, env).await?));
        }

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .current_dir(&self.step.dir)
            .envs(env.bindings())
            .envs(step_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| DaguError::Spawn {
            command: program.clone(),
            source,
        })?;
        self.pid
            .store(child.id().map(|id| id as i32).unwrap_or(0), Ordering::SeqCst);

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        *self.cancel_tx.lock().unwrap() = Some(cancel_tx);

        // A cancel may have landed between prepare() and the spawn, before
        // the trigger and pid existed; catch up here so the child dies now.
        if self.status() == NodeStatus::Canceled {
            let pid = self.pid.load(Ordering::SeqCst);
            if pid > 0 {
                kill_process_group(pid, SignalKind::Term);
            }
        }

        let capture = self
            .step
            .output
            .as_ref()
            .map(|_| Arc::new(Mutex::new(Vec::<u8>::new())));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_pump = stdout.map(|r| {
            tokio::spawn(pump(
                r,
                files.log.clone(),
                files.redirect.clone(),
                capture.clone(),
            ))
        });
        let err_pump = stderr.map(|r| tokio::spawn(pump(r, files.log.clone(), None, None)));

        debug!(
            step = %self.step.name,
            program = %program,
            args = ?args,
            log = ?files.log_path,
            "child spawned"
        );

        let result = tokio::select! {
            status = child.wait() => {
                let status = status
                    .with_context(|| format!("waiting for child of step '{}'", self.step.name))?;
                if self.status() == NodeStatus::Canceled {
                    // A signal raced the exit; the cancel decision stands.
                    ExecResult::Canceled
                } else if status.success() {
                    ExecResult::Success
                } else {
                    ExecResult::Failed(exit_error(&status))
                }
            }
            _ = &mut cancel_rx => {
                let pid = self.pid.load(Ordering::SeqCst);
                if pid > 0 {
                    kill_process_group(pid, SignalKind::Term);
                }
                let _ = child.wait().await;
                ExecResult::Canceled
            }
        };

        if let Some(handle) = out_pump {
            let _ = handle.await;
        }
        if let Some(handle) = err_pump {
            let _ = handle.await;
        }

        self.pid.store(0, Ordering::SeqCst);
        self.cancel_tx.lock().unwrap().take();

        // Publish the captured output before the terminal status becomes
        // visible, so any descendant spawn observes it. Only a successful
        // attempt publishes; a failed child's partial stdout stays out of
        // the run environment even when dependents continue on failure.
        if let (Some(name), Some(buf)) = (&self.step.output, capture) {
            if result == ExecResult::Success {
                let bytes = buf.lock().unwrap();
                let value = String::from_utf8_lossy(&bytes).trim().to_string();
                debug!(step = %self.step.name, var = %name, "captured output");
                env.set(name.clone(), value);
            }
        }

        Ok(result)
    }

    /// Effective `(program, args)` for this attempt.
    ///
    /// The single-string form gets environment expansion only (no backtick
    /// substitution) and is then whitespace-split; the pre-split argv form
    /// interpolates each element in full and uses them directly, with no
    /// split at all. When a script file exists its path is appended as the
    /// final argument, with `sh` as the fallback interpreter.
    async fn resolve_command(
        &self,
        files: &AttemptFiles,
        env: &RunEnv,
    ) -> Result<(String, Vec<String>)> {
        let empty_command = || {
            DaguError::Config(format!("step '{}' has an empty command", self.step.name))
        };

        let (program, mut args) = match &self.step.command {
            Some(CommandLine::Line(line)) => {
                let expanded = expand_env(line, env);
                split_command(&expanded).ok_or_else(empty_command)?
            }
            Some(CommandLine::Argv(argv)) => {
                let mut parts = Vec::with_capacity(argv.len());
                for part in argv {
                    parts.push(interpolate(part, env).await?);
                }
                let mut parts = parts.into_iter();
                let program = parts.next().ok_or_else(empty_command)?;
                (program, parts.collect())
            }
            None if files.script.is_some() => ("sh".to_string(), Vec::new()),
            None => {
                return Err(DaguError::Config(format!(
                    "step '{}' has neither command nor script",
                    self.step.name
                ))
                .into())
            }
        };

        if let Some(script) = &files.script {
            args.push(script.to_string_lossy().into_owned());
        }

        Ok((program, args))
    }

    /// Flush and sync the attempt's sinks and remove the script file.
    ///
    /// Consumes the files, so it runs exactly once per attempt. The first
    /// failure is recorded in `last_error` unless an earlier error is
    /// already present.
    pub(crate) fn teardown(&self, files: AttemptFiles) {
        let mut first_err: Option<String> = None;

        for writer in std::iter::once(&files.log).chain(files.redirect.iter()) {
            let mut guard = writer.lock().unwrap();
            if let Err(err) = guard.flush() {
                first_err.get_or_insert(format!("flushing log writer: {err}"));
            }
            if let Err(err) = guard.get_ref().sync_all() {
                first_err.get_or_insert(format!("syncing log file: {err}"));
            }
        }

        if let Some(script) = files.script {
            if let Err(err) = script.close() {
                first_err.get_or_insert(format!("removing script file: {err}"));
            }
        }

        if let Some(message) = first_err {
            warn!(step = %self.step.name, error = %message, "teardown failure");
            self.record_teardown_error(message);
        }
    }
}

/// Copy child output into the attempt's sinks.
///
/// stdout and stderr share the log writer without per-line locking, so
/// lines may interleave at sub-line boundaries under heavy output.
async fn pump<R>(
    mut reader: R,
    log: SharedWriter,
    redirect: Option<SharedWriter>,
    capture: Option<Arc<Mutex<Vec<u8>>>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if let Err(err) = log.lock().unwrap().write_all(chunk) {
                    warn!(error = %err, "writing child output to log");
                }
                if let Some(redirect) = &redirect {
                    if let Err(err) = redirect.lock().unwrap().write_all(chunk) {
                        warn!(error = %err, "writing child output to redirect");
                    }
                }
                if let Some(capture) = &capture {
                    capture.lock().unwrap().extend_from_slice(chunk);
                }
            }
        }
    }
}

fn exit_error(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Replace any non-filename-safe character with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Signals the executor can deliver to a node's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Term,
    Kill,
}

#[cfg(unix)]
fn kill_process_group(pid: i32, sig: SignalKind) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = match sig {
        SignalKind::Term => Signal::SIGTERM,
        SignalKind::Kill => Signal::SIGKILL,
    };
    if let Err(err) = signal::kill(Pid::from_raw(-pid), sig) {
        warn!(pid, error = %err, "sending signal to process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: i32, _sig: SignalKind) {
    // Process-group signalling needs a job-object equivalent here; the
    // cancel trigger path still terminates the direct child.
}
