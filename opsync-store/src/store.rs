//! The operation log store contract consumed by the sync engine.

use crate::entry::{LogEntry, OpOrigin, StateSnapshot};
use crate::error::StoreResult;
use crate::operation::Operation;
use opsync_clock::VectorClock;
use opsync_types::{ClientId, OpId};
use std::collections::BTreeSet;

/// Append-only operation log plus a compacted snapshot and sync metadata.
///
/// Every mutating call is atomic with respect to concurrent callers.
/// Callers that read then write several values (append with a freshly
/// computed clock, stale resolution, clean slate) still need an outer
/// serialization lock to keep the sequence consistent.
pub trait OperationLogStore: Send + Sync {
    /// Appends an operation and returns its local sequence number.
    ///
    /// Appending an id that is already logged is a no-op returning the
    /// existing sequence number.
    fn append(&self, op: &Operation, origin: OpOrigin) -> StoreResult<u64>;

    /// Appends and merges the operation's clock into the stored clock in
    /// the same atomic step.
    fn append_with_clock_update(&self, op: &Operation, origin: OpOrigin) -> StoreResult<u64>;

    /// All entries with `seq > after`, in sequence order.
    fn get_ops_after_seq(&self, after: u64) -> StoreResult<Vec<LogEntry>>;

    /// Pending entries in sequence order. Never returns rejected, superseded
    /// or acknowledged operations.
    fn get_unsynced_ops(&self) -> StoreResult<Vec<LogEntry>>;

    fn get_entry(&self, id: &OpId) -> StoreResult<Option<LogEntry>>;

    fn has_op(&self, id: &OpId) -> StoreResult<bool> {
        Ok(self.get_entry(id)?.is_some())
    }

    fn mark_synced(&self, ids: &[OpId]) -> StoreResult<()>;

    fn mark_rejected(&self, ids: &[OpId]) -> StoreResult<()>;

    fn mark_superseded(&self, ids: &[OpId]) -> StoreResult<()>;

    /// Deletes every pending entry; returns how many were removed.
    fn clear_unsynced_ops(&self) -> StoreResult<usize>;

    /// Deletes every full-state entry; returns how many were removed.
    fn clear_full_state_ops(&self) -> StoreResult<usize>;

    /// Deletes every entry. The sequence counter keeps counting.
    fn clear_all_operations(&self) -> StoreResult<()>;

    /// Deletes non-pending entries with `seq <= up_to`.
    fn delete_synced_ops_up_to(&self, up_to: u64) -> StoreResult<usize>;

    fn load_snapshot(&self) -> StoreResult<Option<StateSnapshot>>;

    /// Replaces the snapshot wholesale.
    fn save_snapshot(&self, snapshot: &StateSnapshot) -> StoreResult<()>;

    /// Highest sequence number ever assigned (0 if nothing was appended).
    fn get_last_seq(&self) -> StoreResult<u64>;

    fn get_vector_clock(&self) -> StoreResult<VectorClock>;

    fn set_vector_clock(&self, clock: &VectorClock) -> StoreResult<()>;

    fn get_protected_client_ids(&self) -> StoreResult<BTreeSet<ClientId>>;

    fn set_protected_client_ids(&self, ids: &BTreeSet<ClientId>) -> StoreResult<()>;

    fn get_client_id(&self) -> StoreResult<Option<ClientId>>;

    fn set_client_id(&self, id: &ClientId) -> StoreResult<()>;

    /// Highest server sequence durably processed by this client.
    fn get_last_server_seq(&self) -> StoreResult<u64>;

    fn set_last_server_seq(&self, seq: u64) -> StoreResult<()>;
}
