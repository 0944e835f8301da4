#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Run logs for Strata training jobs.
//!
//! A record is one JSON object: when, who, how severe, a dotted key such as
//! `stacking.level.completed` and free-form fields. Sinks are handed around
//! as `Arc<dyn LogSink>`; this crate keeps no global logger.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity, ordered from chattiest to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-step detail.
    Debug,
    /// Progress.
    Info,
    /// Degraded but continuing, e.g. a budget overrun.
    Warn,
    /// Failure.
    Error,
}

impl LogLevel {
    /// Lowest level still written for a numeric verbosity.
    ///
    /// `0` silences everything, `1` keeps warnings, `2` adds progress and
    /// anything higher adds debug records.
    #[must_use]
    pub const fn from_verbosity(verbose: u8) -> Option<Self> {
        match verbose {
            0 => None,
            1 => Some(Self::Warn),
            2 => Some(Self::Info),
            _ => Some(Self::Debug),
        }
    }

    /// Lowercase name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Wall-clock time the record was built.
    pub at: DateTime<Utc>,
    /// Component writing the record.
    pub target: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted event key.
    pub key: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// Builds a record stamped now, without fields.
    #[must_use]
    pub fn new(target: impl Into<String>, level: LogLevel, key: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            target: target.into(),
            level,
            key: key.into(),
            fields: Map::new(),
        }
    }

    /// Takes the entries of a JSON object as fields. Anything else is dropped.
    #[must_use]
    pub fn with_fields(mut self, fields: Value) -> Self {
        if let Value::Object(map) = fields {
            self.fields = map;
        }
        self
    }

    /// Looks up a single field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Somewhere log records go.
pub trait LogSink: Send + Sync + fmt::Debug {
    /// Writes one record.
    fn write(&self, record: &LogRecord) -> Result<()>;
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Opens `path` for appending, creating missing parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening run log {}", path.display()))?;
        Ok(Self {
            path,
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    /// File being appended to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonLinesSink {
    fn write(&self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        // readers tail the file while a run is in progress
        out.flush()?;
        Ok(())
    }
}

/// Keeps records in memory, for tests and embedding callers.
#[derive(Debug, Default)]
pub struct CaptureSink {
    captured: Mutex<Vec<LogRecord>>,
}

impl CaptureSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.captured.lock().clone()
    }

    /// Records with the given key.
    #[must_use]
    pub fn count(&self, key: &str) -> usize {
        self.captured.lock().iter().filter(|r| r.key == key).count()
    }

    /// Records at exactly `level`.
    #[must_use]
    pub fn count_level(&self, level: LogLevel) -> usize {
        self.captured
            .lock()
            .iter()
            .filter(|r| r.level == level)
            .count()
    }
}

impl LogSink for CaptureSink {
    fn write(&self, record: &LogRecord) -> Result<()> {
        self.captured.lock().push(record.clone());
        Ok(())
    }
}
