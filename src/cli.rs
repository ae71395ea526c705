// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `dagu`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagu",
    version,
    about = "Run a DAG of shell steps declared in a YAML file.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGU_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the DAG once; the exit code reflects the final run status.
    Start {
        /// Parameters passed to the run, e.g. --params="NAME=value pos1 pos2".
        #[arg(long, value_name = "PARAMS")]
        params: Option<String>,

        /// Path to the DAG file (YAML).
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Deliver a cancel intent to the live run of the given DAG file.
    Stop {
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Print the current (or most recent) run snapshot.
    Status {
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Re-run with the parameters and request id of a previous run.
    Retry {
        /// Request id of the run to retry.
        #[arg(long, value_name = "REQUEST_ID")]
        req: String,

        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Walk the DAG and report what would run; no child processes spawned.
    Dry {
        #[arg(long, value_name = "PARAMS")]
        params: Option<String>,

        #[arg(value_name = "FILE")]
        file: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
