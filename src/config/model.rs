// src/config/model.rs

use serde::{Deserialize, Serialize};

/// Top-level DAG definition as read from a YAML file.
///
/// A minimal file looks like:
///
/// ```yaml
/// steps:
///   - name: hello
///     command: echo hello
///   - name: world
///     command: echo world
///     depends:
///       - hello
/// ```
///
/// All sections other than `steps` are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagFile {
    /// Workflow name; defaults to the file stem when omitted.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// One cron expression or a list of them. Consumed by the scheduler
    /// daemon, not by a one-shot run; parsed here so files load cleanly.
    #[serde(default)]
    pub schedule: Option<OneOrMany<String>>,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub tags: Option<OneOrMany<String>>,

    /// DAG-level environment bindings, applied before any step runs.
    #[serde(default)]
    pub env: Vec<EnvEntry>,

    /// Directory for per-step log files; defaults to `$DAGU__LOGS/<name>`.
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Retention window consumed by the external log sweeper.
    #[serde(default, rename = "histRetentionDays")]
    pub hist_retention_days: Option<u32>,

    /// Seconds to wait between step dispatches.
    #[serde(default, rename = "delaySec")]
    pub delay_sec: u64,

    /// Concurrency cap for simultaneously running steps. Default 1 (serial).
    #[serde(default)]
    pub max_active_runs: Option<usize>,

    /// Default parameters, overridable with `--params`.
    #[serde(default)]
    pub params: Option<String>,

    /// Run-level preconditions; when unmet the whole run is skipped.
    #[serde(default)]
    pub preconditions: Vec<Condition>,

    #[serde(default)]
    pub mail_on: MailOn,

    /// Seconds to wait after a cancel before escalating SIGTERM to SIGKILL.
    #[serde(default = "default_max_cleanup_sec", rename = "maxCleanupTimeSec")]
    pub max_cleanup_time_sec: u64,

    /// Lifecycle handler steps, fired after the run status is computed.
    #[serde(default)]
    pub handler_on: HandlerMap,

    #[serde(default)]
    pub steps: Vec<StepDef>,
}

fn default_max_cleanup_sec() -> u64 {
    60
}

/// A YAML value that may be written as a scalar or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(vs) => vs,
        }
    }
}

/// An environment binding, accepted as `NAME=value` or as a single-entry map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvEntry {
    Assign(String),
    Map(std::collections::BTreeMap<String, String>),
}

impl EnvEntry {
    /// Flatten into `(name, value)` pairs, preserving declaration order
    /// within a map entry.
    pub fn pairs(&self) -> Vec<(String, String)> {
        match self {
            EnvEntry::Assign(s) => match s.split_once('=') {
                Some((k, v)) => vec![(k.to_string(), v.to_string())],
                None => vec![(s.clone(), String::new())],
            },
            EnvEntry::Map(m) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// A precondition: run `condition` under the shell and require its trimmed
/// stdout to equal `expected` byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Condition {
    pub condition: String,
    pub expected: String,
}

/// `handlerOn:` section. Each handler is an ordinary step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandlerMap {
    #[serde(default)]
    pub success: Option<StepDef>,
    #[serde(default)]
    pub failure: Option<StepDef>,
    #[serde(default)]
    pub cancel: Option<StepDef>,
    #[serde(default)]
    pub exit: Option<StepDef>,
}

/// One step of the DAG.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDef {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Working directory; defaults to the DAG file's directory.
    #[serde(default)]
    pub dir: Option<String>,

    /// The command to execute, in one of two shapes: a single string that
    /// is split on whitespace after expansion, or a pre-split list whose
    /// elements are used as `(program, args)` directly. When a `script`
    /// is present this is the interpreter (default `sh`).
    #[serde(default)]
    pub command: Option<OneOrMany<String>>,

    /// Inline script body, written to a temp file and appended as the
    /// final argument.
    #[serde(default)]
    pub script: Option<String>,

    /// Redirect the child's stdout to this file (relative to `dir`).
    #[serde(default)]
    pub stdout: Option<String>,

    /// Capture the child's trimmed stdout under this variable name.
    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub env: Vec<EnvEntry>,

    #[serde(default)]
    pub depends: Vec<String>,

    #[serde(default)]
    pub continue_on: ContinueOn,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub repeat_policy: RepeatPolicy,

    #[serde(default)]
    pub mail_on: MailOn,

    #[serde(default)]
    pub preconditions: Vec<Condition>,
}

/// Whether dependents may still run when this step's dependency ends
/// non-Success.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ContinueOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub limit: u32,
    #[serde(default, rename = "intervalSec")]
    pub interval_sec: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RepeatPolicy {
    #[serde(default)]
    pub repeat: bool,
    #[serde(default, rename = "intervalSec")]
    pub interval_sec: u64,
}

/// Mail triggers, consumed by the external notifier.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MailOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub success: bool,
}
