// src/ipc.rs

//! Per-run IPC socket.
//!
//! Each live run binds a unix socket derived from the DAG file's absolute
//! path. The supervisor (and the `stop`/`status` commands) speak a one
//! line-per-request protocol:
//!
//! - `cancel` / `stop`: deliver a cancel intent to the runtime; replies `ok`
//! - `status`: replies with the current run snapshot as one JSON line
//!
//! Duplicate cancel intents are coalesced by the runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{RunReporter, RunSnapshot, RuntimeEvent};
use crate::errors::DaguError;
use crate::exec::node::sanitize_filename;

/// Socket address for the run of a given DAG file.
///
/// The absolute file path is hashed so distinct files with the same stem
/// do not collide.
pub fn socket_path(dag_path: &Path) -> PathBuf {
    let absolute = dag_path
        .canonicalize()
        .unwrap_or_else(|_| dag_path.to_path_buf());
    let digest = blake3::hash(absolute.to_string_lossy().as_bytes());
    let hex = digest.to_hex();
    let hex8 = &hex.as_str()[..8];
    let stem = absolute
        .file_stem()
        .map(|s| sanitize_filename(&s.to_string_lossy()))
        .unwrap_or_else(|| "dag".to_string());

    std::env::temp_dir().join(format!("dagu-{stem}-{hex8}.sock"))
}

/// Listener bound to a run's socket; removed again by [`IpcServer::close`].
pub struct IpcServer {
    path: PathBuf,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
}

impl IpcServer {
    /// Bind the socket, replacing any stale file from a previous run.
    #[cfg(unix)]
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {path:?}"))?;
        }
        let listener = tokio::net::UnixListener::bind(path)
            .with_context(|| format!("binding ipc socket {path:?}"))?;
        info!(path = ?path, "ipc socket bound");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    #[cfg(not(unix))]
    pub fn bind(_path: &Path) -> Result<Self> {
        Err(DaguError::Ipc("unix sockets are not available on this platform".into()).into())
    }

    /// Serve requests until the task is aborted.
    #[cfg(unix)]
    pub fn spawn(
        self,
        reporter: Arc<RunReporter>,
        events_tx: mpsc::Sender<RuntimeEvent>,
    ) -> (PathBuf, JoinHandle<()>) {
        let path = self.path.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _addr) = match self.listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "ipc accept failed");
                        continue;
                    }
                };
                let reporter = reporter.clone();
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, reporter, events_tx).await {
                        debug!(error = %err, "ipc connection error");
                    }
                });
            }
        });
        (path, handle)
    }

    #[cfg(not(unix))]
    pub fn spawn(
        self,
        _reporter: Arc<RunReporter>,
        _events_tx: mpsc::Sender<RuntimeEvent>,
    ) -> (PathBuf, JoinHandle<()>) {
        (self.path.clone(), tokio::spawn(async {}))
    }

    /// Remove a socket file left behind by a finished run.
    pub fn close(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(unix)]
async fn handle_connection(
    stream: tokio::net::UnixStream,
    reporter: Arc<RunReporter>,
    events_tx: mpsc::Sender<RuntimeEvent>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "cancel" | "stop" => {
                info!("ipc: cancel intent received");
                let _ = events_tx.send(RuntimeEvent::CancelRequested).await;
                write_half.write_all(b"ok\n").await?;
            }
            "status" => {
                let snapshot = reporter.snapshot();
                let mut payload = serde_json::to_vec(&snapshot)?;
                payload.push(b'\n');
                write_half.write_all(&payload).await?;
            }
            other => {
                debug!(request = %other, "ipc: unknown request");
                write_half.write_all(b"unknown command\n").await?;
            }
        }
    }

    Ok(())
}

/// Deliver a cancel intent to the live run of `dag_path`.
#[cfg(unix)]
pub async fn send_cancel(dag_path: &Path) -> Result<()> {
    let path = socket_path(dag_path);
    let stream = tokio::net::UnixStream::connect(&path)
        .await
        .map_err(|_| DaguError::Ipc(format!("no live run listening at {path:?}")))?;

    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"cancel\n").await?;
    write_half.shutdown().await?;

    let mut reply = String::new();
    BufReader::new(read_half).read_line(&mut reply).await?;
    Ok(())
}

/// Fetch the live snapshot of the run of `dag_path`.
#[cfg(unix)]
pub async fn fetch_status(dag_path: &Path) -> Result<RunSnapshot> {
    let path = socket_path(dag_path);
    let stream = tokio::net::UnixStream::connect(&path)
        .await
        .map_err(|_| DaguError::Ipc(format!("no live run listening at {path:?}")))?;

    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"status\n").await?;
    write_half.shutdown().await?;

    let mut reply = String::new();
    BufReader::new(read_half).read_line(&mut reply).await?;
    let snapshot: RunSnapshot =
        serde_json::from_str(reply.trim()).context("parsing status reply")?;
    Ok(snapshot)
}

#[cfg(not(unix))]
pub async fn send_cancel(_dag_path: &Path) -> Result<()> {
    Err(DaguError::Ipc("unix sockets are not available on this platform".into()).into())
}

#[cfg(not(unix))]
pub async fn fetch_status(_dag_path: &Path) -> Result<RunSnapshot> {
    Err(DaguError::Ipc("unix sockets are not available on this platform".into()).into())
}
