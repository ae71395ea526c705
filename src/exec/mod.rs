// src/exec/mod.rs

//! Process execution layer.
//!
//! This module turns a step's declared policy into OS-level actions, using
//! `tokio::process::Command`, and reports terminal statuses back to the
//! orchestration runtime.
//!
//! - [`expand`] interpolates environment references and backtick command
//!   substitutions into step fields at dispatch time.
//! - [`condition`] evaluates shell preconditions.
//! - [`node`] owns the per-step state machine: child process, log sinks,
//!   signal/cancel semantics and teardown.
//! - [`runner`] drives one node through its precondition, retry and repeat
//!   policies on a worker task.

pub mod condition;
pub mod expand;
pub mod node;
pub mod runner;

pub use expand::RunEnv;
pub use node::{Node, NodeState, NodeStatus};
pub use runner::{execute_node, run_node};
