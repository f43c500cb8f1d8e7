//! Operational session log.
//!
//! When a log path is configured, every command issued, every raw reply,
//! and every warning or error is appended to a plain-text file as
//! timestamp-prefixed lines. The log is append-only across sessions and
//! entirely optional: an absent path disables logging, and write failures
//! are reported to callers as `Result`s that call sites deliberately
//! ignore with `let _ =` so a broken log never fails an operation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::ConfigError;

/// Handle to an append-only operational log file.
///
/// Cheap to clone; all clones append to the same file through a shared
/// mutex so interleaved sessions cannot tear each other's lines.
#[derive(Debug, Clone)]
pub struct OpLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl OpLog {
    /// Opens (or creates) the log file at `path` in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("operational log opened at {}", path.display());
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Path the log writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamp-prefixed line.
    pub fn record(&self, line: &str) -> Result<(), ConfigError> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| ConfigError::Command {
                command: "oplog".to_string(),
                reason: format!("log lock poisoned: {e}"),
            })?;
        writeln!(guard, "[{}] {}", now_ms(), line.trim_end())?;
        Ok(())
    }

    /// Appends a command and its raw reply as consecutive lines.
    pub fn record_exchange(&self, command: &str, reply: &str) -> Result<(), ConfigError> {
        self.record(&format!("cmd: {command}"))?;
        for line in reply.lines() {
            self.record(&format!("out: {line}"))?;
        }
        Ok(())
    }

    /// Appends a warning line.
    pub fn record_warning(&self, warning: &str) -> Result<(), ConfigError> {
        self.record(&format!("warn: {warning}"))
    }

    /// Appends an error line.
    pub fn record_error(&self, error: &str) -> Result<(), ConfigError> {
        self.record(&format!("error: {error}"))
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_timestamp_prefixed_and_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.log");

        let log = OpLog::open(&path).expect("open log");
        log.record("cmd: show version").expect("record");
        log.record_warning("statement ignored").expect("warn");

        let content = std::fs::read_to_string(&path).expect("read log");
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("cmd: show version"));
        assert!(lines[1].contains("warn: statement ignored"));
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("session.log");

        OpLog::open(&path)
            .expect("open log")
            .record("first")
            .expect("record");
        OpLog::open(&path)
            .expect("reopen log")
            .record("second")
            .expect("record");

        let content = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn exchange_splits_reply_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.log");

        let log = OpLog::open(&path).expect("open log");
        log.record_exchange("show configuration", "line one\nline two")
            .expect("record exchange");

        let content = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("out: line one"));
        assert!(content.contains("out: line two"));
    }
}
