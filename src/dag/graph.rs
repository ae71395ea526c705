// src/dag/graph.rs

use std::collections::HashMap;

use crate::dag::step::Step;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct GraphNode {
    /// Direct dependencies: steps that must reach a terminal status first.
    deps: Vec<String>,
    /// Direct dependents: steps that depend on this one.
    dependents: Vec<String>,
}

/// Simple in-memory DAG representation keyed by step name.
///
/// This is intentionally lightweight; acyclicity is already validated in
/// `config::validate`, so here we just keep adjacency information for
/// scheduling and diagnostics.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<String, GraphNode>,
}

impl DagGraph {
    /// Build adjacency from validated steps.
    pub fn from_steps(steps: &[Step]) -> Self {
        let mut nodes: HashMap<String, GraphNode> = HashMap::new();

        for step in steps {
            nodes.insert(
                step.name.clone(),
                GraphNode {
                    deps: step.depends.clone(),
                    dependents: Vec::new(),
                },
            );
        }

        let names: Vec<String> = nodes.keys().cloned().collect();
        for name in names {
            let deps = nodes
                .get(&name)
                .map(|n| n.deps.clone())
                .unwrap_or_default();

            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(name.clone());
                }
            }
        }

        Self { nodes }
    }

    /// Immediate dependencies of a step (the names listed in its `depends`).
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a step (steps that list this one in `depends`).
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }
}
