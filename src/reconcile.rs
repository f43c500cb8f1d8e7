//! Reconciliation engine: drives one entity from its current device
//! state to its desired state.
//!
//! Every mutation follows the same phase sequence: diff the live state,
//! lock the candidate, apply a delta, commit, verify, unlock. A failure
//! after the lock is acquired enters the aborting path, which rolls the
//! candidate back exactly once and reports the original cause together
//! with any cleanup trouble.
//!
//! The in-process gate in [`ReconcileCtx`] serializes reconciliations
//! that share one context; the device-side candidate lock remains the
//! real arbiter across processes.

use std::fmt;

use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::codec::{ConfigDelta, Resource, decode_dump, encode_resource};
use crate::config::Tunables;
use crate::error::{CleanupOutcome, ConfigError};
use crate::oplog::OpLog;
use crate::session::{Transport, candidate};

/// The mutation being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// Where in the reconciliation sequence an operation currently is.
///
/// Carried in [`ConfigError::Aborted`] so a failure names the exact
/// phase it interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Locking,
    Diffing,
    Applying,
    Committing,
    Verifying,
    Aborting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Locking => "locking",
            Phase::Diffing => "diffing",
            Phase::Applying => "applying",
            Phase::Committing => "committing",
            Phase::Verifying => "verifying",
            Phase::Aborting => "aborting",
        })
    }
}

/// Shared context for a family of reconciliations.
///
/// Cancelling `cancel` aborts any in-flight lock wait; an operation that
/// already holds the device lock runs to completion.
pub struct ReconcileCtx {
    pub tunables: Tunables,
    pub oplog: Option<OpLog>,
    pub cancel: CancellationToken,
    gate: Mutex<()>,
}

impl ReconcileCtx {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            tunables,
            oplog: None,
            cancel: CancellationToken::new(),
            gate: Mutex::new(()),
        }
    }

    pub fn with_oplog(mut self, oplog: OpLog) -> Self {
        self.oplog = Some(oplog);
        self
    }
}

impl Default for ReconcileCtx {
    fn default() -> Self {
        Self::new(Tunables::default())
    }
}

/// Drives reconciliation of entities over one transport.
///
/// Borrows the transport exclusively for its lifetime: one reconciler,
/// one session, no interleaved commands.
pub struct Reconciler<'a, T: Transport> {
    transport: &'a mut T,
    ctx: &'a ReconcileCtx,
}

impl<'a, T: Transport> Reconciler<'a, T> {
    pub fn new(transport: &'a mut T, ctx: &'a ReconcileCtx) -> Self {
        Self { transport, ctx }
    }

    /// Reads the live state of the entity `probe` identifies.
    ///
    /// `Ok(None)` means the entity is absent on the device.
    pub async fn read<R: Resource>(&mut self, probe: &R) -> Result<Option<R>, ConfigError> {
        let _guard = self.ctx.gate.lock().await;
        self.fetch(probe).await
    }

    /// Creates an entity that must not yet exist.
    ///
    /// Returns the commit warnings on success. The desired record is
    /// validated and encoded before the device is touched at all, so a
    /// contradictory record costs no round-trip and no lock.
    pub async fn create<R: Resource>(&mut self, record: &R) -> Result<Vec<String>, ConfigError> {
        let delta = encode_resource(record)?;
        let entity = record.key();
        let _guard = self.ctx.gate.lock().await;

        self.phase(Operation::Create, &entity, Phase::Diffing);
        if self.fetch(record).await?.is_some() {
            return Err(ConfigError::AlreadyExists { entity });
        }

        self.lock(Operation::Create, &entity).await?;

        self.phase(Operation::Create, &entity, Phase::Applying);
        if let Err(cause) = candidate::apply(self.transport, &delta).await {
            return Err(self
                .abort(Operation::Create, &entity, Phase::Applying, cause)
                .await);
        }

        self.phase(Operation::Create, &entity, Phase::Committing);
        let warnings =
            match candidate::commit(self.transport, &format!("create {entity}")).await {
                Ok(warnings) => warnings,
                Err(cause) => {
                    return Err(self
                        .abort(Operation::Create, &entity, Phase::Committing, cause)
                        .await);
                }
            };

        self.phase(Operation::Create, &entity, Phase::Verifying);
        match self.fetch(record).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(self.inconsistent(&entity).await),
            Err(cause) => {
                return Err(self
                    .abort(Operation::Create, &entity, Phase::Verifying, cause)
                    .await);
            }
        }

        self.unlock(&entity).await;
        Ok(warnings)
    }

    /// Brings an existing entity to the desired state.
    ///
    /// The delta replaces the entity wholesale: one `delete` of its base
    /// path followed by the full desired encoding, so stale fields can
    /// never survive an update. A device already in the desired state is
    /// a no-op that takes no lock.
    pub async fn update<R: Resource>(&mut self, record: &R) -> Result<Vec<String>, ConfigError> {
        let encoded = encode_resource(record)?;
        let entity = record.key();
        let _guard = self.ctx.gate.lock().await;

        self.phase(Operation::Update, &entity, Phase::Diffing);
        if self.fetch(record).await?.as_ref() == Some(record) {
            debug!("{entity}: already in desired state");
            return Ok(Vec::new());
        }
        let mut delta = ConfigDelta::new();
        delta.delete(&record.base_path());
        delta.extend(encoded);

        self.lock(Operation::Update, &entity).await?;

        self.phase(Operation::Update, &entity, Phase::Applying);
        if let Err(cause) = candidate::apply(self.transport, &delta).await {
            return Err(self
                .abort(Operation::Update, &entity, Phase::Applying, cause)
                .await);
        }

        self.phase(Operation::Update, &entity, Phase::Committing);
        let warnings =
            match candidate::commit(self.transport, &format!("update {entity}")).await {
                Ok(warnings) => warnings,
                Err(cause) => {
                    return Err(self
                        .abort(Operation::Update, &entity, Phase::Committing, cause)
                        .await);
                }
            };

        self.phase(Operation::Update, &entity, Phase::Verifying);
        match self.fetch(record).await {
            Ok(Some(live)) if &live == record => {}
            Ok(_) => return Err(self.inconsistent(&entity).await),
            Err(cause) => {
                return Err(self
                    .abort(Operation::Update, &entity, Phase::Verifying, cause)
                    .await);
            }
        }

        self.unlock(&entity).await;
        Ok(warnings)
    }

    /// Removes an entity. An already-absent entity is a successful no-op
    /// that takes no lock and commits nothing.
    pub async fn delete<R: Resource>(&mut self, probe: &R) -> Result<Vec<String>, ConfigError> {
        let entity = probe.key();
        let _guard = self.ctx.gate.lock().await;

        self.phase(Operation::Delete, &entity, Phase::Diffing);
        if self.fetch(probe).await?.is_none() {
            debug!("{entity}: already absent");
            return Ok(Vec::new());
        }

        self.lock(Operation::Delete, &entity).await?;

        let mut delta = ConfigDelta::new();
        delta.delete(&probe.base_path());

        self.phase(Operation::Delete, &entity, Phase::Applying);
        if let Err(cause) = candidate::apply(self.transport, &delta).await {
            return Err(self
                .abort(Operation::Delete, &entity, Phase::Applying, cause)
                .await);
        }

        self.phase(Operation::Delete, &entity, Phase::Committing);
        let warnings =
            match candidate::commit(self.transport, &format!("delete {entity}")).await {
                Ok(warnings) => warnings,
                Err(cause) => {
                    return Err(self
                        .abort(Operation::Delete, &entity, Phase::Committing, cause)
                        .await);
                }
            };

        self.phase(Operation::Delete, &entity, Phase::Verifying);
        match self.fetch(probe).await {
            Ok(None) => {}
            Ok(Some(_)) => return Err(self.inconsistent(&entity).await),
            Err(cause) => {
                return Err(self
                    .abort(Operation::Delete, &entity, Phase::Verifying, cause)
                    .await);
            }
        }

        self.unlock(&entity).await;
        Ok(warnings)
    }

    /// Fetches and decodes the live per-entity configuration dump.
    async fn fetch<R: Resource>(&mut self, probe: &R) -> Result<Option<R>, ConfigError> {
        let command = format!(
            "show configuration {} | display set relative",
            probe.base_path()
        );
        let dump = self.transport.run_command(&command).await?;
        decode_dump(probe, &dump)
    }

    /// Acquires the device-side candidate lock, honoring cancellation.
    ///
    /// A failure here needs no rollback: nothing has been mutated and no
    /// lock is held.
    async fn lock(&mut self, operation: Operation, entity: &str) -> Result<(), ConfigError> {
        self.phase(operation, entity, Phase::Locking);
        candidate::acquire_lock(
            self.transport,
            self.ctx.tunables.lock_poll_interval,
            &self.ctx.cancel,
        )
        .await
    }

    /// Releases the lock after a fully committed and verified operation.
    /// Failure here cannot un-commit anything; it is recorded, not raised.
    async fn unlock(&mut self, entity: &str) {
        if let CleanupOutcome::Failed(detail) = candidate::release_lock(self.transport).await {
            debug!("{entity}: {detail}");
            if let Some(oplog) = self.ctx.oplog.as_ref() {
                let _ = oplog.record_warning(&format!("{entity}: {detail}"));
            }
        }
    }

    /// Rolls the candidate back exactly once and wraps the original
    /// failure. Rollback trouble lands in the cleanup list, never in
    /// place of the cause.
    async fn abort(
        &mut self,
        operation: Operation,
        entity: &str,
        phase: Phase,
        cause: ConfigError,
    ) -> ConfigError {
        self.phase(operation, entity, Phase::Aborting);
        let mut cleanup = Vec::new();
        if let Err(e) = candidate::rollback(self.transport).await {
            cleanup.push(e.to_string());
        }
        ConfigError::Aborted {
            operation,
            entity: entity.to_string(),
            phase,
            cause: Box::new(cause),
            cleanup,
        }
    }

    /// Post-commit readback contradicted the committed state. The commit
    /// stands, so only the lock is released before reporting.
    async fn inconsistent(&mut self, entity: &str) -> ConfigError {
        self.unlock(entity).await;
        ConfigError::PostCommitConsistency {
            entity: entity.to_string(),
        }
    }

    fn phase(&self, operation: Operation, entity: &str, phase: Phase) {
        debug!("{operation} {entity}: {phase}");
        if let Some(oplog) = self.ctx.oplog.as_ref() {
            let _ = oplog.record(&format!("{operation} {entity}: {phase}"));
        }
    }
}
