// src/config/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::DagFile;
use crate::errors::{DaguError, Result};

/// Run semantic validation against a loaded DAG file.
///
/// This checks:
/// - there is at least one step
/// - step names are unique
/// - all `depends` entries refer to existing steps
/// - the step graph has no cycles
///
/// It does **not** run any shell expressions; preconditions and command
/// strings are only evaluated at dispatch time.
pub fn validate_config(file: &DagFile) -> Result<()> {
    ensure_has_steps(file)?;
    validate_unique_names(file)?;
    validate_dependencies(file)?;
    validate_dag(file)?;
    Ok(())
}

fn ensure_has_steps(file: &DagFile) -> Result<()> {
    if file.steps.is_empty() {
        return Err(DaguError::Config(
            "DAG file must contain at least one step".to_string(),
        ));
    }
    Ok(())
}

fn validate_unique_names(file: &DagFile) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &file.steps {
        if step.name.trim().is_empty() {
            return Err(DaguError::Config("step with empty name".to_string()));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(DaguError::Config(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
    }
    Ok(())
}

fn validate_dependencies(file: &DagFile) -> Result<()> {
    let names: HashSet<&str> = file.steps.iter().map(|s| s.name.as_str()).collect();
    for step in &file.steps {
        for dep in &step.depends {
            if !names.contains(dep.as_str()) {
                return Err(DaguError::UnknownStep(format!(
                    "'{}' (in depends of '{}')",
                    dep, step.name
                )));
            }
            if dep == &step.name {
                return Err(DaguError::Config(format!(
                    "step '{}' cannot depend on itself",
                    step.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(file: &DagFile) -> Result<()> {
    // Edge direction: dep -> step. For:
    //   - name: b
    //     depends: [a]
    // we add edge a -> b.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for step in &file.steps {
        graph.add_node(step.name.as_str());
    }

    for step in &file.steps {
        for dep in &step.depends {
            graph.add_edge(dep.as_str(), step.name.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(DaguError::DagCycle(cycle.node_id().to_string())),
    }
}
