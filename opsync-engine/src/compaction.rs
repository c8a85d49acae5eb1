//! Folding the operation log into a state snapshot.

use crate::applicator::ApplicationState;
use crate::clock_service::VectorClockService;
use crate::error::SyncResult;
use opsync_store::{OperationLogStore, StateSnapshot};
use opsync_types::Timestamp;
use tracing::{debug, info};

/// Replaces folded history with a snapshot once the log grows past a
/// threshold.
#[derive(Debug, Clone, Copy)]
pub struct CompactionService {
    threshold: usize,
    schema_version: u32,
}

impl CompactionService {
    #[must_use]
    pub fn new(threshold: usize, schema_version: u32) -> Self {
        Self {
            threshold,
            schema_version,
        }
    }

    /// Compacts if at least `threshold` operations were logged since the last
    /// snapshot.
    pub fn compact_if_needed(
        &self,
        clocks: &VectorClockService,
        app: &dyn ApplicationState,
        store: &dyn OperationLogStore,
    ) -> SyncResult<Option<StateSnapshot>> {
        let after = store.load_snapshot()?.map_or(0, |s| s.last_applied_op_seq);
        let since = store.get_ops_after_seq(after)?.len();
        if since < self.threshold {
            debug!("Skipping compaction: {} of {} ops", since, self.threshold);
            return Ok(None);
        }
        self.compact(clocks, app, store).map(Some)
    }

    /// Writes a snapshot of the current state at the latest sequence and
    /// deletes the non-pending entries it covers.
    pub fn compact(
        &self,
        clocks: &VectorClockService,
        app: &dyn ApplicationState,
        store: &dyn OperationLogStore,
    ) -> SyncResult<StateSnapshot> {
        let seq = store.get_last_seq()?;
        let snapshot = StateSnapshot {
            state: app.get_full_state_snapshot(),
            last_applied_op_seq: seq,
            vector_clock: clocks.get_current_global_clock().clone(),
            compacted_at: Timestamp::now(),
            schema_version: self.schema_version,
        };
        store.save_snapshot(&snapshot)?;
        let removed = store.delete_synced_ops_up_to(seq)?;
        info!("Compacted log at seq {}, removed {} entries", seq, removed);
        Ok(snapshot)
    }
}
