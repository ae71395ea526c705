// src/history.rs

//! Per-request run history.
//!
//! One JSON file per request id under `{data}/history/{dag-name}/`. The
//! `status` command falls back to the latest file when no live run
//! answers; `retry` recovers a previous request's parameters from here.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::engine::RunSnapshot;
use crate::errors::DaguError;
use crate::exec::node::sanitize_filename;

pub fn history_dir(data_dir: &Path, dag_name: &str) -> PathBuf {
    data_dir.join("history").join(sanitize_filename(dag_name))
}

/// Persist a run snapshot under its request id.
pub fn write_snapshot(dir: &Path, snapshot: &RunSnapshot) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating history dir {dir:?}"))?;

    let path = dir.join(format!("{}.json", sanitize_filename(&snapshot.request_id)));
    let payload =
        serde_json::to_vec_pretty(snapshot).context("serializing run snapshot")?;
    fs::write(&path, payload).with_context(|| format!("writing history file {path:?}"))?;

    debug!(path = ?path, "run snapshot written");
    Ok(())
}

/// Load the snapshot recorded for a request id.
pub fn read_snapshot(dir: &Path, request_id: &str) -> Result<RunSnapshot> {
    let path = dir.join(format!("{}.json", sanitize_filename(request_id)));
    let contents = fs::read_to_string(&path)
        .map_err(|_| DaguError::UnknownRequest(request_id.to_string()))?;
    let snapshot =
        serde_json::from_str(&contents).with_context(|| format!("parsing {path:?}"))?;
    Ok(snapshot)
}

/// Most recently written snapshot, if any.
pub fn latest_snapshot(dir: &Path) -> Result<Option<RunSnapshot>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };

    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if latest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            latest = Some((modified, path));
        }
    }

    match latest {
        Some((_, path)) => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading {path:?}"))?;
            let snapshot = serde_json::from_str(&contents)
                .with_context(|| format!("parsing {path:?}"))?;
            Ok(Some(snapshot))
        }
        None => Ok(None),
    }
}
