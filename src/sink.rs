//! Offline delta sink.
//!
//! The same deltas the reconciler would push over a live session can
//! instead be appended to a local file, one imperative line per file
//! line. The result is a script an operator can paste into a device's
//! configuration mode, or feed into a change-review process, without the
//! engine ever touching the network.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::codec::{ConfigDelta, Resource, encode_resource};
use crate::error::ConfigError;

/// File-backed destination for configuration deltas.
///
/// Appends across calls and across sink instances, so one file can
/// accumulate the lines of an entire change set.
#[derive(Debug, Clone)]
pub struct OfflineSink {
    path: PathBuf,
}

impl OfflineSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path the sink writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends every line of `delta`, newline-terminated, creating the
    /// file and its parent directories on first use. An empty delta
    /// leaves the file untouched.
    pub fn append(&self, delta: &ConfigDelta) -> Result<(), ConfigError> {
        if delta.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(delta.to_text().as_bytes())?;
        debug!(
            "appended {} line(s) to {}",
            delta.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Encodes `record` and appends its creation delta.
    pub fn append_resource<R: Resource>(&self, record: &R) -> Result<(), ConfigError> {
        self.append(&encode_resource(record)?)
    }

    /// Appends the delta that would remove the entity `record` names.
    pub fn append_removal<R: Resource>(&self, record: &R) -> Result<(), ConfigError> {
        let mut delta = ConfigDelta::new();
        delta.delete(&record.base_path());
        self.append(&delta)
    }
}
