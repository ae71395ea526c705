// src/dag/step.rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::model::{
    Condition, ContinueOn, DagFile, MailOn, OneOrMany, RepeatPolicy, RetryPolicy, StepDef,
};
use crate::config::{data_dir, default_log_dir};
use crate::exec::expand::split_fields;

/// Validated runtime form of a DAG file.
///
/// Field values are still uninterpolated strings; expansion happens at
/// dispatch time so captured outputs of earlier steps are visible.
#[derive(Debug, Clone)]
pub struct Dag {
    pub name: String,
    pub description: Option<String>,
    /// Directory containing the DAG file; default working directory for steps.
    pub base_dir: PathBuf,
    pub log_dir: PathBuf,
    pub data_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub params: Params,
    pub preconditions: Vec<Condition>,
    pub delay_between_steps: Duration,
    pub max_active_runs: usize,
    pub max_cleanup_time: Duration,
    pub steps: Vec<Step>,
    pub handlers: Handlers,
}

/// The two command input shapes a step accepts.
#[derive(Debug, Clone)]
pub enum CommandLine {
    /// Single command-with-args string; env-expanded, then split on
    /// whitespace.
    Line(String),
    /// Pre-split program + arguments; each element interpolated in full
    /// and used directly, so arguments may contain whitespace.
    Argv(Vec<String>),
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Line(line) => f.write_str(line),
            CommandLine::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// One step in its runtime form.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub description: Option<String>,
    pub dir: PathBuf,
    /// When `script` is present this is the interpreter (default `sh`).
    pub command: Option<CommandLine>,
    pub script: Option<String>,
    pub stdout: Option<String>,
    pub output: Option<String>,
    pub env: Vec<(String, String)>,
    pub depends: Vec<String>,
    pub continue_on: ContinueOn,
    pub retry: RetryPolicy,
    pub repeat: RepeatPolicy,
    pub mail_on: MailOn,
    pub preconditions: Vec<Condition>,
}

/// Lifecycle handler steps; each runs through the ordinary executor path.
#[derive(Debug, Clone, Default)]
pub struct Handlers {
    pub success: Option<Step>,
    pub failure: Option<Step>,
    pub cancel: Option<Step>,
    pub exit: Option<Step>,
}

/// Parsed run parameters.
///
/// Named entries (`NAME=value`) become environment bindings; positional
/// entries are addressable as `$1, $2, …`.
#[derive(Debug, Clone, Default)]
pub struct Params {
    pub raw: Option<String>,
    pub named: Vec<(String, String)>,
    pub positional: Vec<String>,
}

/// Split a `--params` string into named and positional parameters.
///
/// Fields are whitespace-separated with double/single-quote grouping; a
/// field is named when it contains `=` and the part before it is a valid
/// variable name.
pub fn parse_params(raw: &str) -> Params {
    let mut named = Vec::new();
    let mut positional = Vec::new();

    for field in split_fields(raw) {
        match field.split_once('=') {
            Some((key, value)) if is_var_name(key) => {
                named.push((key.to_string(), value.to_string()));
            }
            _ => positional.push(field),
        }
    }

    Params {
        raw: Some(raw.to_string()),
        named,
        positional,
    }
}

fn is_var_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Dag {
    /// Build the runtime DAG from a validated file.
    ///
    /// `params_override` replaces the file's default `params` when given.
    pub fn from_file(
        file: DagFile,
        path: &Path,
        params_override: Option<&str>,
    ) -> Self {
        let name = file.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dagu".to_string())
        });

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let log_dir = file
            .log_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| default_log_dir(&name));

        let params = params_override
            .or(file.params.as_deref())
            .map(parse_params)
            .unwrap_or_default();

        let env = file.env.iter().flat_map(|e| e.pairs()).collect();

        let steps = file
            .steps
            .iter()
            .map(|def| Step::from_def(def, &base_dir))
            .collect();

        let handlers = Handlers {
            success: file.handler_on.success.as_ref().map(|d| Step::from_def(d, &base_dir)),
            failure: file.handler_on.failure.as_ref().map(|d| Step::from_def(d, &base_dir)),
            cancel: file.handler_on.cancel.as_ref().map(|d| Step::from_def(d, &base_dir)),
            exit: file.handler_on.exit.as_ref().map(|d| Step::from_def(d, &base_dir)),
        };

        Dag {
            name,
            description: file.description.clone(),
            base_dir,
            log_dir,
            data_dir: data_dir(),
            env,
            params,
            preconditions: file.preconditions.clone(),
            delay_between_steps: Duration::from_secs(file.delay_sec),
            max_active_runs: file.max_active_runs.filter(|&n| n > 0).unwrap_or(1),
            max_cleanup_time: Duration::from_secs(file.max_cleanup_time_sec),
            steps,
            handlers,
        }
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

impl Step {
    fn from_def(def: &StepDef, base_dir: &Path) -> Self {
        let dir = match &def.dir {
            Some(d) => {
                let p = PathBuf::from(d);
                if p.is_absolute() {
                    p
                } else {
                    base_dir.join(p)
                }
            }
            None => base_dir.to_path_buf(),
        };

        let command = def.command.clone().map(|c| match c {
            OneOrMany::One(line) => CommandLine::Line(line),
            OneOrMany::Many(argv) => CommandLine::Argv(argv),
        });

        Step {
            name: def.name.clone(),
            description: def.description.clone(),
            dir,
            command,
            script: def.script.clone().filter(|s| !s.is_empty()),
            stdout: def.stdout.clone(),
            output: def.output.clone(),
            env: def.env.iter().flat_map(|e| e.pairs()).collect(),
            depends: def.depends.clone(),
            continue_on: def.continue_on,
            retry: def.retry_policy,
            repeat: def.repeat_policy,
            mail_on: def.mail_on,
            preconditions: def.preconditions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_positional_params() {
        let params = parse_params("FOO=1 BAR=two pos1 pos2");
        assert_eq!(
            params.named,
            vec![
                ("FOO".to_string(), "1".to_string()),
                ("BAR".to_string(), "two".to_string())
            ]
        );
        assert_eq!(params.positional, vec!["pos1", "pos2"]);
    }

    #[test]
    fn quoted_value_stays_one_field() {
        let params = parse_params(r#"MSG="hello world" 42"#);
        assert_eq!(
            params.named,
            vec![("MSG".to_string(), "hello world".to_string())]
        );
        assert_eq!(params.positional, vec!["42"]);
    }

    #[test]
    fn field_without_valid_name_is_positional() {
        let params = parse_params("1=x plain");
        assert!(params.named.is_empty());
        assert_eq!(params.positional, vec!["1=x", "plain"]);
    }
}
