// src/logging.rs

//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Level resolution order: the `--log-level` flag when given, then the
//! `DAGU_LOG` environment variable, then `info`. Child-process output
//! never goes through tracing; it lands in the per-step log files.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

impl From<LogLevel> for Level {
    fn from(lvl: LogLevel) -> Self {
        match lvl {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Install the global subscriber. Call once at startup; a second call
/// panics, which is fine for a CLI entry point.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let level = cli_level
        .map(Level::from)
        .or_else(|| {
            // tracing::Level parses "error" | "warn" | "info" | "debug"
            // | "trace" case-insensitively.
            std::env::var("DAGU_LOG").ok()?.trim().parse().ok()
        })
        .unwrap_or(Level::INFO);

    fmt().with_max_level(level).with_target(true).init();
    Ok(())
}
