// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaguError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("cycle detected in step graph involving '{0}'")]
    DagCycle(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("no run found for request id '{0}'")]
    UnknownRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DaguError>;
