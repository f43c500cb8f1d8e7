//! Candidate configuration operations: lock, apply, commit, rollback.
//!
//! The device-side lock is the true concurrency-control primitive: it
//! serializes all writers, including writers from entirely separate
//! processes. Everything here operates over [`Transport`] so the same
//! coordination runs against a live session or a scripted one.

use tokio_util::sync::CancellationToken;

use super::*;
use crate::codec::ConfigDelta;

/// Polls for exclusive ownership of the candidate configuration.
///
/// A refused lock sleeps `poll_interval` and retries; the poll is
/// unbounded until either success or caller cancellation, which is
/// checked before every attempt and during every sleep. Cancellation
/// returns [`ConfigError::LockAborted`] with nothing mutated, so no
/// rollback is required.
pub async fn acquire_lock<T: Transport>(
    transport: &mut T,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), ConfigError> {
    loop {
        if cancel.is_cancelled() {
            return Err(ConfigError::LockAborted);
        }

        let reply = transport.run_rpc(LOCK_RPC).await?;
        match rpc_issues(&reply)
            .into_iter()
            .find(|issue| issue.severity == IssueSeverity::Error)
        {
            None => {
                debug!("candidate lock acquired");
                return Ok(());
            }
            Some(issue) => {
                debug!("candidate lock busy: {}", issue.message);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConfigError::LockAborted),
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
}

/// Releases the candidate lock, best-effort.
///
/// Always invoked as part of normal completion; its own failure is
/// reported but never masks whatever triggered the release.
pub async fn release_lock<T: Transport>(transport: &mut T) -> CleanupOutcome {
    match transport.run_rpc(UNLOCK_RPC).await {
        Ok(reply) => {
            match rpc_issues(&reply)
                .into_iter()
                .find(|issue| issue.severity == IssueSeverity::Error)
            {
                None => CleanupOutcome::Clean,
                Some(issue) => {
                    debug!("unlock refused: {}", issue.message);
                    CleanupOutcome::Failed(format!("unlock refused: {}", issue.message))
                }
            }
        }
        Err(e) => {
            debug!("unlock failed: {e}");
            CleanupOutcome::Failed(format!("unlock failed: {e}"))
        }
    }
}

/// Submits a delta to the candidate configuration as one atomic load.
///
/// A failed load leaves the candidate in whatever partial state the
/// device kept; rolling it back is deliberately the caller's decision,
/// not this function's.
pub async fn apply<T: Transport>(
    transport: &mut T,
    delta: &ConfigDelta,
) -> Result<(), ConfigError> {
    if delta.is_empty() {
        return Ok(());
    }

    let reply = transport
        .run_rpc(&load_set_rpc(&delta.to_text()))
        .await
        .map_err(|e| ConfigError::Apply {
            lines: delta.len(),
            reason: e.to_string(),
        })?;

    if let Some(issue) = rpc_issues(&reply)
        .into_iter()
        .find(|issue| issue.severity == IssueSeverity::Error)
    {
        return Err(ConfigError::Apply {
            lines: delta.len(),
            reason: issue.message,
        });
    }
    Ok(())
}

/// Commits the candidate configuration with a log message.
///
/// Returns the non-fatal warnings the device attached to an accepted
/// commit. A rejected commit carries those same warnings alongside the
/// rejection reason.
pub async fn commit<T: Transport>(
    transport: &mut T,
    message: &str,
) -> Result<Vec<String>, ConfigError> {
    let reply = transport.run_rpc(&commit_rpc(message)).await?;

    let issues = rpc_issues(&reply);
    let warnings = issues
        .iter()
        .filter(|issue| issue.severity == IssueSeverity::Warning)
        .map(|issue| issue.message.clone())
        .collect::<Vec<_>>();

    if let Some(issue) = issues
        .iter()
        .find(|issue| issue.severity == IssueSeverity::Error)
    {
        return Err(ConfigError::Commit {
            reason: issue.message.clone(),
            warnings,
        });
    }
    Ok(warnings)
}

/// Discards the candidate edits and releases the lock, always both.
///
/// The two device operations are coupled: releasing the lock without
/// discarding edits, or the reverse, leaves the device inconsistent for
/// the next caller. Errors from either sub-step are aggregated, never
/// dropped; warnings are returned on full success.
pub async fn rollback<T: Transport>(transport: &mut T) -> Result<Vec<String>, ConfigError> {
    let mut warnings = Vec::new();
    let mut details = Vec::new();

    match transport.run_rpc(DISCARD_RPC).await {
        Ok(reply) => {
            for issue in rpc_issues(&reply) {
                match issue.severity {
                    IssueSeverity::Warning => warnings.push(issue.message),
                    IssueSeverity::Error => details.push(format!("discard: {}", issue.message)),
                }
            }
        }
        Err(e) => details.push(format!("discard: {e}")),
    }

    match transport.run_rpc(UNLOCK_RPC).await {
        Ok(reply) => {
            for issue in rpc_issues(&reply) {
                match issue.severity {
                    IssueSeverity::Warning => warnings.push(issue.message),
                    IssueSeverity::Error => details.push(format!("unlock: {}", issue.message)),
                }
            }
        }
        Err(e) => details.push(format!("unlock: {e}")),
    }

    if details.is_empty() {
        return Ok(warnings);
    }
    details.extend(warnings.into_iter().map(|w| format!("warning: {w}")));
    Err(ConfigError::Rollback { details })
}
