//! In-memory operation log, used by tests and ephemeral sessions.

use crate::entry::{EntryStatus, LogEntry, OpOrigin, StateSnapshot};
use crate::error::{StoreError, StoreResult};
use crate::operation::Operation;
use crate::store::OperationLogStore;
use opsync_clock::VectorClock;
use opsync_types::{ClientId, OpId};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    entries: Vec<LogEntry>,
    last_seq: u64,
    snapshot: Option<StateSnapshot>,
    clock: VectorClock,
    protected: BTreeSet<ClientId>,
    client_id: Option<ClientId>,
    last_server_seq: u64,
}

impl Inner {
    fn append(&mut self, op: &Operation, origin: OpOrigin) -> u64 {
        if let Some(existing) = self.entries.iter().find(|e| e.op.id == op.id) {
            return existing.seq;
        }
        self.last_seq += 1;
        self.entries.push(LogEntry {
            seq: self.last_seq,
            op: op.clone(),
            origin,
            status: origin.initial_status(),
        });
        self.last_seq
    }

    fn set_status(&mut self, ids: &[OpId], status: EntryStatus) {
        for entry in self.entries.iter_mut().filter(|e| ids.contains(&e.op.id)) {
            entry.status = status;
        }
    }

    fn remove_where(&mut self, pred: impl Fn(&LogEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(e));
        before - self.entries.len()
    }
}

/// Mutex-guarded operation log kept entirely in memory.
#[derive(Default)]
pub struct MemoryOpLogStore {
    inner: Mutex<Inner>,
}

impl MemoryOpLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl OperationLogStore for MemoryOpLogStore {
    fn append(&self, op: &Operation, origin: OpOrigin) -> StoreResult<u64> {
        Ok(self.lock()?.append(op, origin))
    }

    fn append_with_clock_update(&self, op: &Operation, origin: OpOrigin) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let seq = inner.append(op, origin);
        inner.clock.merge(&op.vector_clock);
        Ok(seq)
    }

    fn get_ops_after_seq(&self, after: u64) -> StoreResult<Vec<LogEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect())
    }

    fn get_unsynced_ops(&self) -> StoreResult<Vec<LogEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.is_pending())
            .cloned()
            .collect())
    }

    fn get_entry(&self, id: &OpId) -> StoreResult<Option<LogEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .find(|e| e.op.id == *id)
            .cloned())
    }

    fn mark_synced(&self, ids: &[OpId]) -> StoreResult<()> {
        self.lock()?.set_status(ids, EntryStatus::Synced);
        Ok(())
    }

    fn mark_rejected(&self, ids: &[OpId]) -> StoreResult<()> {
        self.lock()?.set_status(ids, EntryStatus::Rejected);
        Ok(())
    }

    fn mark_superseded(&self, ids: &[OpId]) -> StoreResult<()> {
        self.lock()?.set_status(ids, EntryStatus::Superseded);
        Ok(())
    }

    fn clear_unsynced_ops(&self) -> StoreResult<usize> {
        Ok(self.lock()?.remove_where(LogEntry::is_pending))
    }

    fn clear_full_state_ops(&self) -> StoreResult<usize> {
        Ok(self.lock()?.remove_where(|e| e.op.is_full_state()))
    }

    fn clear_all_operations(&self) -> StoreResult<()> {
        self.lock()?.entries.clear();
        Ok(())
    }

    fn delete_synced_ops_up_to(&self, up_to: u64) -> StoreResult<usize> {
        Ok(self
            .lock()?
            .remove_where(|e| e.seq <= up_to && !e.is_pending()))
    }

    fn load_snapshot(&self) -> StoreResult<Option<StateSnapshot>> {
        Ok(self.lock()?.snapshot.clone())
    }

    fn save_snapshot(&self, snapshot: &StateSnapshot) -> StoreResult<()> {
        self.lock()?.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn get_last_seq(&self) -> StoreResult<u64> {
        Ok(self.lock()?.last_seq)
    }

    fn get_vector_clock(&self) -> StoreResult<VectorClock> {
        Ok(self.lock()?.clock.clone())
    }

    fn set_vector_clock(&self, clock: &VectorClock) -> StoreResult<()> {
        self.lock()?.clock = clock.clone();
        Ok(())
    }

    fn get_protected_client_ids(&self) -> StoreResult<BTreeSet<ClientId>> {
        Ok(self.lock()?.protected.clone())
    }

    fn set_protected_client_ids(&self, ids: &BTreeSet<ClientId>) -> StoreResult<()> {
        self.lock()?.protected = ids.clone();
        Ok(())
    }

    fn get_client_id(&self) -> StoreResult<Option<ClientId>> {
        Ok(self.lock()?.client_id.clone())
    }

    fn set_client_id(&self, id: &ClientId) -> StoreResult<()> {
        self.lock()?.client_id = Some(id.clone());
        Ok(())
    }

    fn get_last_server_seq(&self) -> StoreResult<u64> {
        Ok(self.lock()?.last_server_seq)
    }

    fn set_last_server_seq(&self, seq: u64) -> StoreResult<()> {
        self.lock()?.last_server_seq = seq;
        Ok(())
    }
}
