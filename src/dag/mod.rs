// src/dag/mod.rs

//! Runtime DAG representation.
//!
//! - [`graph`] holds a simple directed acyclic graph of steps.
//! - [`step`] contains the validated runtime form of a DAG file: steps in
//!   declared order, resolved policies, parameters and handler steps.

pub mod graph;
pub mod step;

pub use graph::DagGraph;
pub use step::{parse_params, CommandLine, Dag, Handlers, Params, Step};
