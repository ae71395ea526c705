// src/exec/condition.rs

//! Precondition evaluation.
//!
//! Each condition's expression runs as a single shell command inheriting
//! the run environment; the trimmed stdout must equal the expected literal
//! byte-for-byte. The first non-matching condition stops evaluation.

use std::process::Stdio;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::model::Condition;
use crate::exec::expand::{interpolate, shell_command, RunEnv};

/// Outcome of evaluating a condition list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// All conditions matched (or the list was empty).
    Met,
    /// A condition did not match; the node must be skipped, not failed.
    Unmet {
        condition: String,
        expected: String,
        actual: String,
    },
}

impl ConditionOutcome {
    pub fn is_met(&self) -> bool {
        matches!(self, ConditionOutcome::Met)
    }
}

/// Evaluate conditions in order.
///
/// An expression that fails to launch is an error, distinct from an unmet
/// condition. No timeout is imposed here; the enclosing run context owns
/// cancellation.
pub async fn evaluate_conditions(
    conditions: &[Condition],
    env: &RunEnv,
) -> Result<ConditionOutcome> {
    for cond in conditions {
        let expression = interpolate(&cond.condition, env).await?;

        let output = shell_command(&expression, env)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("launching condition '{}'", cond.condition))?;

        let actual = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(
            condition = %cond.condition,
            expected = %cond.expected,
            actual = %actual,
            "evaluated precondition"
        );

        if actual != cond.expected {
            return Ok(ConditionOutcome::Unmet {
                condition: cond.condition.clone(),
                expected: cond.expected.clone(),
                actual,
            });
        }
    }

    Ok(ConditionOutcome::Met)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn cond(expression: &str, expected: &str) -> Condition {
        Condition {
            condition: expression.to_string(),
            expected: expected.to_string(),
        }
    }

    #[tokio::test]
    async fn empty_list_is_met() {
        let env = RunEnv::new();
        let outcome = evaluate_conditions(&[], &env).await.unwrap();
        assert!(outcome.is_met());
    }

    #[tokio::test]
    async fn trimmed_stdout_matches_expected() {
        let env = RunEnv::new();
        let outcome = evaluate_conditions(&[cond("echo 01", "01")], &env)
            .await
            .unwrap();
        assert!(outcome.is_met());
    }

    #[tokio::test]
    async fn mismatch_reports_actual_value() {
        let env = RunEnv::new();
        let outcome = evaluate_conditions(&[cond("echo 01", "02")], &env)
            .await
            .unwrap();
        match outcome {
            ConditionOutcome::Unmet { actual, expected, .. } => {
                assert_eq!(actual, "01");
                assert_eq!(expected, "02");
            }
            other => panic!("expected Unmet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expression_sees_run_env() {
        let env = RunEnv::new();
        env.set("ANSWER", "42");
        let outcome = evaluate_conditions(&[cond("echo $ANSWER", "42")], &env)
            .await
            .unwrap();
        assert!(outcome.is_met());
    }
}
