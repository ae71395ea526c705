// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::model::DagFile;
use crate::config::validate::validate_config;

/// Load a DAG file from a given path and return the raw `DagFile`.
///
/// This only performs YAML deserialization; it does **not** perform semantic
/// validation (graph correctness, etc.). Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<DagFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading DAG file at {:?}", path))?;

    let mut file: DagFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing YAML from {:?}", path))?;

    if file.name.is_none() {
        file.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
    }

    Ok(file)
}

/// Load a DAG file from path and run semantic validation.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads YAML and applies defaults.
/// - Checks for duplicate step names, unknown `depends` references and
///   cycles in the step graph.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<DagFile> {
    let file = load_from_path(&path)?;
    validate_config(&file)?;
    Ok(file)
}

/// Root directory for run history and other persistent state.
///
/// `DAGU__DATA` overrides the default of `~/.dagu/data`.
pub fn data_dir() -> PathBuf {
    match std::env::var("DAGU__DATA") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home_dir().join(".dagu").join("data"),
    }
}

/// Default log directory for a DAG when its file does not set `logDir`.
///
/// `DAGU__LOGS` overrides the default of `~/.dagu/logs`.
pub fn default_log_dir(dag_name: &str) -> PathBuf {
    let base = match std::env::var("DAGU__LOGS") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home_dir().join(".dagu").join("logs"),
    };
    base.join(dag_name)
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
