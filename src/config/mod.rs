// src/config/mod.rs

//! Configuration loading and validation for dagu.
//!
//! Responsibilities:
//! - Define the YAML-backed data model (`model.rs`).
//! - Load a DAG file from disk (`loader.rs`).
//! - Validate basic invariants like graph correctness (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{data_dir, default_log_dir, load_and_validate, load_from_path};
pub use model::{
    Condition, ContinueOn, DagFile, EnvEntry, HandlerMap, MailOn, OneOrMany, RepeatPolicy,
    RetryPolicy, StepDef,
};
pub use validate::validate_config;
