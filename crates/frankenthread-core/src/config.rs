//! Runtime configuration.
//!
//! Read from the environment once, when the process-wide runtime context is
//! created:
//! - `FRANKENTHREAD_LOG`: minimum structured-log level
//!   (`off` (default), `error`, `warn`, `info`, `debug`, `trace`).
//! - `FRANKENTHREAD_LOG_FILE`: JSONL destination; stderr when unset.
//! - `FRANKENTHREAD_STACK_SIZE`: stack bytes for runtime-created threads
//!   (default 2 MiB; values below 64 KiB are raised to 64 KiB).
//! - `FRANKENTHREAD_THREAD_PREFIX`: OS thread-name prefix (default `ft`).
//!
//! Parsing is loose and never fails: unrecognized values fall back to the
//! default.

use std::path::PathBuf;

use crate::log::LogLevel;

/// Default thread stack size: 2 MiB.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Smallest stack size accepted from the environment.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

pub const DEFAULT_THREAD_PREFIX: &str = "ft";

pub const ENV_LOG: &str = "FRANKENTHREAD_LOG";
pub const ENV_LOG_FILE: &str = "FRANKENTHREAD_LOG_FILE";
pub const ENV_STACK_SIZE: &str = "FRANKENTHREAD_STACK_SIZE";
pub const ENV_THREAD_PREFIX: &str = "FRANKENTHREAD_THREAD_PREFIX";

/// Where structured log lines go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogTarget {
    #[default]
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Minimum level emitted; `None` disables logging.
    pub log_level: Option<LogLevel>,
    pub log_target: LogTarget,
    pub stack_size: usize,
    pub thread_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            log_target: LogTarget::Stderr,
            stack_size: DEFAULT_STACK_SIZE,
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
        }
    }
}

/// Parse a log filter; `None` means logging is off.
#[must_use]
pub fn parse_log_filter(raw: &str) -> Option<LogLevel> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "0" | "" => None,
        other => Some(LogLevel::from_str_loose(other)),
    }
}

fn parse_stack_size(raw: &str) -> usize {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(n) = raw.strip_suffix('k') {
        (n, 1024)
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, 1024 * 1024)
    } else {
        (raw.as_str(), 1)
    };
    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .map_or(DEFAULT_STACK_SIZE, |n| n.max(MIN_STACK_SIZE))
}

impl RuntimeConfig {
    /// Configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            log_level: lookup(ENV_LOG).and_then(|v| parse_log_filter(&v)),
            log_target: lookup(ENV_LOG_FILE)
                .filter(|v| !v.trim().is_empty())
                .map_or(LogTarget::Stderr, |v| LogTarget::File(PathBuf::from(v))),
            stack_size: lookup(ENV_STACK_SIZE).map_or(defaults.stack_size, |v| parse_stack_size(&v)),
            thread_prefix: lookup(ENV_THREAD_PREFIX)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.thread_prefix),
        }
    }

    /// Whether events at `level` are emitted.
    #[must_use]
    pub fn logs(&self, level: LogLevel) -> bool {
        self.log_level.is_some_and(|min| level >= min)
    }
}
