// src/exec/expand.rs

//! Interpolation of step fields at dispatch time.
//!
//! Two substitutions, in order:
//! 1. `${NAME}` and `$NAME` are replaced from the run environment (which
//!    includes captured outputs of earlier steps) with the process
//!    environment as fallback. Unresolved names expand to empty.
//! 2. A backtick-delimited substring is executed as a shell command and
//!    replaced with its trimmed stdout.
//!
//! The single-string `command:` form gets substitution (1) only;
//! splitting happens after expansion, and command substitution output
//! containing whitespace would make the split ambiguous. The list form
//! never splits, so its elements get both substitutions.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::process::Command;

/// Mutable environment scoped to a single run.
///
/// Lookups fall back to the process environment; writes never leave the
/// run, so concurrent runs in one process do not observe each other's
/// captured outputs.
#[derive(Debug, Clone, Default)]
pub struct RunEnv {
    vars: Arc<Mutex<HashMap<String, String>>>,
}

impl RunEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(v) = self.vars.lock().unwrap().get(name) {
            return Some(v.clone());
        }
        std::env::var(name).ok()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.lock().unwrap().insert(name.into(), value.into());
    }

    /// Run-scoped bindings to merge into a child's environment.
    pub fn bindings(&self) -> Vec<(String, String)> {
        let vars = self.vars.lock().unwrap();
        vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Replace `${NAME}` and `$NAME` references from the run environment.
///
/// `$1, $2, …` positional parameters are valid names. Unresolved names
/// expand to the empty string.
pub fn expand_env(input: &str, env: &RunEnv) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&env.get(&name).unwrap_or_default());
                } else {
                    // No closing brace; keep the literal text.
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some((_, c)) if is_name_char(*c) => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if is_name_char(*c) {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&env.get(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Full interpolation: environment expansion, then backtick command
/// substitution. An unterminated backtick is kept literally.
pub async fn interpolate(input: &str, env: &RunEnv) -> Result<String> {
    let expanded = expand_env(input, env);
    if !expanded.contains('`') {
        return Ok(expanded);
    }

    let mut out = String::with_capacity(expanded.len());
    let mut rest = expanded.as_str();

    while let Some(start) = rest.find('`') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('`') {
            Some(end) => {
                let command = &after[..end];
                out.push_str(&run_substitution(command, env).await?);
                rest = &after[end + 1..];
            }
            None => {
                out.push('`');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    Ok(out)
}

async fn run_substitution(command: &str, env: &RunEnv) -> Result<String> {
    let output = shell_command(command, env)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("running command substitution `{command}`"))?;

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Build a platform shell invocation with the run-scoped bindings applied.
pub fn shell_command(line: &str, env: &RunEnv) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(line);
        c
    };
    cmd.envs(env.bindings());
    cmd
}

/// Split a command line into `(program, args)` after interpolation.
pub fn split_command(line: &str) -> Option<(String, Vec<String>)> {
    let mut fields = split_fields(line).into_iter();
    let program = fields.next()?;
    Some((program, fields.collect()))
}

/// Whitespace field splitting with double/single-quote grouping; quotes
/// are stripped from the fields.
pub fn split_fields(input: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_field = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                    in_field = true;
                } else if c.is_whitespace() {
                    if in_field {
                        fields.push(std::mem::take(&mut current));
                        in_field = false;
                    }
                } else {
                    current.push(c);
                    in_field = true;
                }
            }
        }
    }
    if in_field {
        fields.push(current);
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_braced_and_bare_names() {
        let env = RunEnv::new();
        env.set("GREETING", "hi");
        assert_eq!(expand_env("${GREETING} there", &env), "hi there");
        assert_eq!(expand_env("$GREETING there", &env), "hi there");
    }

    #[test]
    fn unresolved_names_expand_to_empty() {
        let env = RunEnv::new();
        assert_eq!(expand_env("[${NO_SUCH_VAR_XYZ}]", &env), "[]");
    }

    #[test]
    fn positional_params_are_valid_names() {
        let env = RunEnv::new();
        env.set("1", "first");
        assert_eq!(expand_env("arg=$1", &env), "arg=first");
    }

    #[test]
    fn lone_dollar_is_literal() {
        let env = RunEnv::new();
        assert_eq!(expand_env("cost: 5$", &env), "cost: 5$");
    }

    #[test]
    fn run_env_shadows_process_env() {
        let env = RunEnv::new();
        env.set("PATH", "overridden");
        assert_eq!(env.get("PATH").as_deref(), Some("overridden"));
    }

    #[test]
    fn splits_quoted_fields() {
        assert_eq!(
            split_fields(r#"echo "hello world" 'x y' plain"#),
            vec!["echo", "hello world", "x y", "plain"]
        );
    }

    #[test]
    fn split_command_separates_program() {
        let (program, args) = split_command("echo a b").unwrap();
        assert_eq!(program, "echo");
        assert_eq!(args, vec!["a", "b"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn backtick_substitution_uses_trimmed_stdout() {
        let env = RunEnv::new();
        let out = interpolate("value=`echo 01`", &env).await.unwrap();
        assert_eq!(out, "value=01");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unterminated_backtick_is_literal() {
        let env = RunEnv::new();
        let out = interpolate("a`b", &env).await.unwrap();
        assert_eq!(out, "a`b");
    }
}
