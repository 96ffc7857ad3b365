//! Structured JSONL runtime log.
//!
//! Provides:
//! - [`LogEntry`]: one JSON object per line with required `timestamp`,
//!   `level`, `event` and optional thread / pool / status context.
//! - [`LogSink`]: destination (off, stderr, file, or an in-memory buffer for
//!   tests) behind a `parking_lot` lock.
//!
//! The runtime's own primitives never log: the sink lock is a
//! `parking_lot` mutex, so logging never re-enters `sync::Mutex`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{LogTarget, RuntimeConfig};

/// Severity level, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name; anything unrecognized means `Info`.
    #[must_use]
    pub fn from_str_loose(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Canonical structured log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<u64>,
    /// Thread exit status (`completed`, `cancelled`, `killed`, `panicked`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            level,
            event: event.into(),
            thread_id: None,
            thread_name: None,
            pool_id: None,
            status: None,
            exit_code: None,
            errno: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, id: u64, name: Option<&str>) -> Self {
        self.thread_id = Some(id);
        self.thread_name = name.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool_id: u64) -> Self {
        self.pool_id = Some(pool_id);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>, exit_code: Option<i32>) -> Self {
        self.status = Some(status.into());
        self.exit_code = exit_code;
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

enum Writer {
    Off,
    Stderr,
    File(BufWriter<File>),
    Buffer(Vec<u8>),
}

/// Log destination with a minimum level filter.
pub struct LogSink {
    min: Option<LogLevel>,
    writer: Mutex<Writer>,
}

impl LogSink {
    /// A sink that drops every entry.
    #[must_use]
    pub fn off() -> Self {
        Self {
            min: None,
            writer: Mutex::new(Writer::Off),
        }
    }

    #[must_use]
    pub fn stderr(min: LogLevel) -> Self {
        Self {
            min: Some(min),
            writer: Mutex::new(Writer::Stderr),
        }
    }

    pub fn to_file(path: &Path, min: LogLevel) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            min: Some(min),
            writer: Mutex::new(Writer::File(BufWriter::new(file))),
        })
    }

    /// In-memory sink, read back with [`LogSink::contents`].
    #[must_use]
    pub fn to_buffer(min: LogLevel) -> Self {
        Self {
            min: Some(min),
            writer: Mutex::new(Writer::Buffer(Vec::new())),
        }
    }

    /// Sink described by `config`. An unopenable log file falls back to
    /// stderr; the failure is reported as the sink's first entry.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let Some(min) = config.log_level else {
            return Self::off();
        };
        match &config.log_target {
            LogTarget::Stderr => Self::stderr(min),
            LogTarget::File(path) => match Self::to_file(path, min) {
                Ok(sink) => sink,
                Err(err) => {
                    let sink = Self::stderr(min);
                    sink.emit(
                        LogEntry::new(LogLevel::Warn, "log.open_failed").with_details(
                            serde_json::json!({
                                "path": path.display().to_string(),
                                "error": err.to_string(),
                            }),
                        ),
                    );
                    sink
                }
            },
        }
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.min.is_some_and(|min| level >= min)
    }

    /// Write one entry if its level passes the filter. Write failures are
    /// dropped: logging must never change runtime behavior.
    pub fn emit(&self, entry: LogEntry) {
        if !self.enabled(entry.level) {
            return;
        }
        let Ok(line) = entry.to_jsonl() else {
            return;
        };
        let mut writer = self.writer.lock();
        let _ = match &mut *writer {
            Writer::Off => Ok(()),
            Writer::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
            Writer::File(file) => writeln!(file, "{line}"),
            Writer::Buffer(buf) => writeln!(buf, "{line}"),
        };
    }

    pub fn flush(&self) -> std::io::Result<()> {
        match &mut *self.writer.lock() {
            Writer::File(file) => file.flush(),
            Writer::Stderr => std::io::stderr().flush(),
            Writer::Off | Writer::Buffer(_) => Ok(()),
        }
    }

    /// Lines written so far to a buffer sink; empty for other sinks.
    #[must_use]
    pub fn contents(&self) -> Vec<LogEntry> {
        match &*self.writer.lock() {
            Writer::Buffer(buf) => String::from_utf8_lossy(buf)
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("min", &self.min).finish()
    }
}

/// RFC 3339 UTC timestamp with millisecond precision.
fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(LogLevel::from_str_loose(" WARNING "), LogLevel::Warn);
    }

    #[test]
    fn entry_serializes_only_present_fields() {
        let line = LogEntry::new(LogLevel::Info, "thread.exit")
            .with_thread(7, Some("ft-7"))
            .with_status("completed", Some(0))
            .to_jsonl()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "info");
        assert_eq!(value["event"], "thread.exit");
        assert_eq!(value["thread_id"], 7);
        assert_eq!(value["exit_code"], 0);
        assert!(value.get("pool_id").is_none());
        assert!(value.get("details").is_none());
    }

    #[test]
    fn buffer_sink_filters_by_level() {
        let sink = LogSink::to_buffer(LogLevel::Info);
        sink.emit(LogEntry::new(LogLevel::Debug, "dropped"));
        sink.emit(LogEntry::new(LogLevel::Warn, "kept").with_pool(3));
        let entries = sink.contents();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "kept");
        assert_eq!(entries[0].pool_id, Some(3));
    }

    #[test]
    fn off_sink_emits_nothing() {
        let sink = LogSink::off();
        assert!(!sink.enabled(LogLevel::Error));
        sink.emit(LogEntry::new(LogLevel::Error, "ignored"));
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn timestamp_is_rfc3339_utc() {
        let ts = now_utc();
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn civil_date_conversion_matches_known_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
    }
}
