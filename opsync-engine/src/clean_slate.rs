//! Destructive re-baseline: new identity, one full-state operation, purged
//! history.

use crate::applicator::ApplicationState;
use crate::clock_service::{LocalIdentity, VectorClockService};
use crate::error::SyncResult;
use opsync_store::{OpOrigin, Operation, OperationLogStore, StateSnapshot};
use opsync_types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Why a clean slate was started. Sent to the server as the snapshot reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanSlateReason {
    EncryptionEnabled,
    EncryptionDisabled,
    FullImport,
    ManualRecovery,
    /// The local counter neared the safe integer limit.
    CounterReset,
    /// The user chose to keep local data over remote.
    ForceUpload,
}

impl CleanSlateReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EncryptionEnabled => "ENCRYPTION_ENABLED",
            Self::EncryptionDisabled => "ENCRYPTION_DISABLED",
            Self::FullImport => "FULL_IMPORT",
            Self::ManualRecovery => "MANUAL_RECOVERY",
            Self::CounterReset => "COUNTER_RESET",
            Self::ForceUpload => "FORCE_UPLOAD",
        }
    }

    fn action_label(&self) -> String {
        format!("[All] Clean Slate ({})", self.as_str())
    }
}

/// Builds and persists clean-slate operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanSlateService {
    schema_version: u32,
}

impl CleanSlateService {
    #[must_use]
    pub fn new(schema_version: u32) -> Self {
        Self { schema_version }
    }

    /// Re-baselines on the current application state under a new identity.
    pub fn create_clean_slate(
        &self,
        reason: CleanSlateReason,
        clocks: &mut VectorClockService,
        app: &dyn ApplicationState,
        store: &dyn OperationLogStore,
    ) -> SyncResult<Operation> {
        if let Err(e) = app.backup() {
            warn!("Pre-clean-slate backup failed, continuing: {}", e);
        }
        let state = app.get_full_state_snapshot();
        let identity = LocalIdentity::mint();
        let op = Operation::full_state(
            reason.action_label(),
            state,
            identity.client_id().clone(),
            identity.clock().clone(),
        )
        .with_schema_version(self.schema_version);

        self.persist(&op, identity, clocks, store)?;
        info!(
            "Clean slate ({}) complete, new client id {}",
            reason.as_str(),
            op.client_id
        );
        Ok(op)
    }

    /// Re-baselines on imported state, keeping the current identity. The
    /// import is stamped like any local op, pruned to the size cap, since
    /// every key it carries becomes protected.
    pub fn create_clean_slate_from_import(
        &self,
        imported: Value,
        reason: CleanSlateReason,
        clocks: &mut VectorClockService,
        app: &dyn ApplicationState,
        store: &dyn OperationLogStore,
    ) -> SyncResult<Operation> {
        if let Err(e) = app.backup() {
            warn!("Pre-import backup failed, continuing: {}", e);
        }
        let client_id = clocks.client_id().clone();
        let clock = clocks.next_local_clock();
        let op = Operation::full_state(reason.action_label(), imported, client_id.clone(), clock.clone())
            .with_schema_version(self.schema_version);

        app.load_full_state(op.payload.clone())?;
        self.persist(&op, LocalIdentity::new(client_id, clock), clocks, store)?;
        info!("Imported state as clean slate ({})", reason.as_str());
        Ok(op)
    }

    fn persist(
        &self,
        op: &Operation,
        identity: LocalIdentity,
        clocks: &mut VectorClockService,
        store: &dyn OperationLogStore,
    ) -> SyncResult<()> {
        store.clear_all_operations()?;
        store.set_client_id(identity.client_id())?;
        store.set_vector_clock(identity.clock())?;
        let seq = store.append(op, OpOrigin::CleanSlate)?;
        store.save_snapshot(&StateSnapshot {
            state: op.payload.clone(),
            last_applied_op_seq: seq,
            vector_clock: op.vector_clock.clone(),
            compacted_at: Timestamp::now(),
            schema_version: self.schema_version,
        })?;

        clocks.reset(identity);
        clocks.record(op);
        store.set_protected_client_ids(clocks.protected_client_ids())?;
        Ok(())
    }
}
