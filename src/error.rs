//! Error types for device configuration management.
//!
//! This module defines all errors that can occur while connecting to a
//! device, exchanging commands, encoding or decoding set-line records,
//! and driving a reconciliation through lock, apply, commit and rollback.

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

use crate::reconcile::{Operation, Phase};

/// Errors that can occur during configuration management operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Establishing or authenticating the SSH session failed.
    ///
    /// Covers connect timeouts, authentication rejections, and
    /// transport-level failures. Fatal; this layer never retries.
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// The device answered but reported no resolvable identity.
    ///
    /// A session whose identity probe yields an empty hardware model is
    /// unusable, because all higher logic depends on the device identity
    /// being known. Treated as fatal even though the transport succeeded.
    #[error("device at {addr} reported no resolvable identity")]
    Identity { addr: String },

    /// A single command was rejected by the device.
    ///
    /// Propagated as-is to the reconciler, which decides whether the
    /// failure is abort-worthy.
    #[error("command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    /// The caller cancelled while waiting for the configuration lock.
    ///
    /// Nothing was mutated, so no rollback is required.
    #[error("lock wait aborted by caller")]
    LockAborted,

    /// A record refused to encode because its fields contradict each other.
    ///
    /// Raised before any device interaction.
    #[error("invalid record '{entity}': {reason}")]
    Validation { entity: String, reason: String },

    /// Submitting a configuration delta to the candidate failed.
    ///
    /// The candidate configuration may hold partial edits; rolling it back
    /// is the caller's responsibility.
    #[error("load of {lines} configuration lines failed: {reason}")]
    Apply { lines: usize, reason: String },

    /// The device rejected the commit.
    ///
    /// Non-fatal warnings gathered from the same reply are carried
    /// alongside the rejection reason.
    #[error("commit rejected: {reason}")]
    Commit {
        reason: String,
        warnings: Vec<String>,
    },

    /// Discarding candidate edits and/or releasing the lock failed.
    ///
    /// Both sub-steps always run; every failure is aggregated here rather
    /// than masked by the first one.
    #[error("rollback incomplete: {}", details.join("; "))]
    Rollback { details: Vec<String> },

    /// The commit succeeded but the read-back contradicts it.
    ///
    /// Surfaced distinctly from apply/commit failures: the commit already
    /// took effect, so no automatic rollback is attempted.
    #[error("read-back of '{entity}' contradicts the committed state")]
    PostCommitConsistency { entity: String },

    /// A reconciliation was aborted and rolled back.
    ///
    /// Wraps the original failure as the source; `cleanup` records what
    /// the rollback attempted and whether it succeeded, appended to the
    /// causal chain rather than substituted for it.
    #[error("{operation} of '{entity}' aborted in {phase} phase: {cause}")]
    Aborted {
        operation: Operation,
        entity: String,
        phase: Phase,
        #[source]
        cause: Box<ConfigError>,
        cleanup: Vec<String>,
    },

    /// The entity already exists on the device and cannot be created again.
    #[error("entity '{entity}' already exists on the device")]
    AlreadyExists { entity: String },

    /// The transport channel closed while waiting for a reply.
    #[error("channel disconnect while waiting for reply")]
    ChannelDisconnect,

    /// Session initialization did not complete within the connect timeout.
    ///
    /// The error contains the partial output received before the timeout.
    #[error("session init timeout: {0}")]
    InitTimeout(String),

    /// A scripted transport was asked for an exchange it does not contain.
    #[error("script mismatch: {0}")]
    ScriptMismatch(String),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// Failed to send data through the channel.
    #[error("failed to send data: {0}")]
    SendDataError(#[from] SendError<String>),

    /// Filesystem error from the offline sink or the operational log.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport script serialization error.
    #[error("script encode/decode error: {0}")]
    ScriptCodec(#[from] serde_json::Error),
}

/// Outcome of a best-effort cleanup step such as unlock or close.
///
/// Cleanup failures are deliberate fire-and-forget: they are logged and
/// reported through this type, never propagated as hard errors, because
/// the caller cannot meaningfully recover once all other work is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The cleanup step completed.
    Clean,
    /// The cleanup step failed; the detail was logged.
    Failed(String),
}

impl CleanupOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, CleanupOutcome::Clean)
    }

    /// Failure detail, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            CleanupOutcome::Clean => None,
            CleanupOutcome::Failed(detail) => Some(detail),
        }
    }
}
