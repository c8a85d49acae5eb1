//! Entity-level conflict detection and last-writer-wins resolution.

use crate::applicator::ApplicationState;
use crate::clock_service::VectorClockService;
use crate::error::SyncResult;
use opsync_clock::{merge_and_increment, CausalOrder, VectorClock};
use opsync_store::{OpOrigin, OpType, Operation, OperationLogStore};
use opsync_types::{ClientId, EntityKey, OpId, Timestamp};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::iter;
use tracing::{debug, info};

/// Pending local and incoming remote operations that touch the same entity
/// with concurrent clocks.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConflict {
    pub key: EntityKey,
    pub local_ops: Vec<Operation>,
    pub remote_ops: Vec<Operation>,
    pub local_clock: VectorClock,
    pub remote_clock: VectorClock,
}

impl EntityConflict {
    /// Latest `(timestamp, client)` on each side.
    fn latest(ops: &[Operation]) -> Option<(Timestamp, &ClientId)> {
        ops.iter().map(|op| (op.timestamp, &op.client_id)).max()
    }

    /// True if the remote side wins last-writer-wins.
    #[must_use]
    pub fn remote_wins(&self) -> bool {
        Self::latest(&self.remote_ops) > Self::latest(&self.local_ops)
    }

    /// Timestamp of the winning side.
    #[must_use]
    pub fn winning_timestamp(&self) -> Timestamp {
        let side = if self.remote_wins() { &self.remote_ops } else { &self.local_ops };
        Self::latest(side).map_or_else(Timestamp::now, |(ts, _)| ts)
    }
}

/// Which side a resolved conflict kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// What resolving one conflict did.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub key: EntityKey,
    pub winner: Winner,
    /// The dominating operation appended for upload, if any.
    pub emitted: Option<Operation>,
    /// Local operations marked superseded.
    pub superseded: Vec<OpId>,
}

/// Detects and resolves concurrent edits per entity.
#[derive(Debug, Clone)]
pub struct ConflictResolutionService {
    max_clock_size: usize,
}

impl ConflictResolutionService {
    #[must_use]
    pub fn new(max_clock_size: usize) -> Self {
        Self { max_clock_size }
    }

    /// Groups both sets by entity; an entity touched on both sides whose
    /// merged clocks compare concurrent is a conflict.
    #[must_use]
    pub fn detect_conflicts(
        &self,
        local_pending: &[Operation],
        remote: &[Operation],
    ) -> Vec<EntityConflict> {
        let local = group_by_entity(local_pending);
        let incoming = group_by_entity(remote);

        let mut conflicts = Vec::new();
        for (key, remote_ops) in incoming {
            let Some(local_ops) = local.get(&key) else {
                continue;
            };
            let local_clock = merged_clock(local_ops);
            let remote_clock = merged_clock(&remote_ops);
            if local_clock.compare_with_limit(&remote_clock, self.max_clock_size)
                == CausalOrder::Concurrent
            {
                debug!("Conflict on {}", key);
                conflicts.push(EntityConflict {
                    key,
                    local_ops: local_ops.iter().map(|op| (*op).clone()).collect(),
                    remote_ops: remote_ops.into_iter().cloned().collect(),
                    local_clock,
                    remote_clock,
                });
            }
        }
        conflicts
    }

    /// Merges `clocks` and increments `client`. The result dominates every
    /// input.
    #[must_use]
    pub fn merge_and_increment_clocks(clocks: &[VectorClock], client: &ClientId) -> VectorClock {
        merge_and_increment(clocks, client)
    }

    /// Builds a whole-entity replacement operation.
    #[must_use]
    pub fn create_lww_update_op(
        entity_type: &str,
        entity_id: &str,
        current_state: Value,
        client_id: ClientId,
        vector_clock: VectorClock,
        timestamp: Timestamp,
    ) -> Operation {
        Operation::lww_update(
            entity_type,
            entity_id,
            current_state,
            client_id,
            vector_clock,
            timestamp,
        )
    }

    /// Resolves one conflict. The remote operations must already be in the
    /// log.
    ///
    /// The winner is the side with the latest timestamp (client id breaks
    /// ties). If the remote side wins its operations are applied. Either
    /// way the local operations are superseded and, if the entity still
    /// exists, one LWW update carrying its full current state is appended
    /// with a clock that dominates both sides. A local delete that wins is
    /// re-emitted as a dominating delete instead.
    pub fn resolve(
        &self,
        conflict: &EntityConflict,
        clocks: &mut VectorClockService,
        app: &dyn ApplicationState,
        store: &dyn OperationLogStore,
    ) -> SyncResult<Resolution> {
        let winner = if conflict.remote_wins() {
            Winner::Remote
        } else {
            Winner::Local
        };
        let timestamp = conflict.winning_timestamp();

        if winner == Winner::Remote {
            for op in &conflict.remote_ops {
                app.apply_operation(op)?;
            }
        }

        let superseded: Vec<OpId> = conflict.local_ops.iter().map(|op| op.id).collect();
        store.mark_superseded(&superseded)?;

        let me = clocks.client_id().clone();
        let clock = merge_and_increment(
            [&conflict.local_clock, &conflict.remote_clock]
                .into_iter()
                .chain(iter::once(clocks.get_current_global_clock())),
            &me,
        )
        .limit_size(&me, clocks.protected_client_ids(), self.max_clock_size);

        let key = &conflict.key;
        let emitted = match app.get_current_entity_state(&key.entity_type, &key.entity_id) {
            Some(state) => Some(Self::create_lww_update_op(
                &key.entity_type,
                &key.entity_id,
                state,
                me,
                clock,
                timestamp,
            )),
            None if winner == Winner::Local => Some(
                Operation::new(
                    format!("[{}] Delete", key.entity_type),
                    OpType::Delete,
                    key.entity_type.clone(),
                    key.entity_id.clone(),
                    Value::Null,
                    me,
                    clock,
                )
                .with_timestamp(timestamp),
            ),
            None => None,
        };

        if let Some(op) = &emitted {
            clocks.commit(store, op, OpOrigin::Local)?;
        }
        info!(
            "Resolved conflict on {}: {:?} wins, {} local ops superseded",
            key,
            winner,
            superseded.len()
        );

        Ok(Resolution {
            key: key.clone(),
            winner,
            emitted,
            superseded,
        })
    }

    /// Superseded local operations can touch entities outside any conflict,
    /// as a batch does when only some of its targets were edited remotely.
    /// Each such entity is re-emitted as a dominating whole-entity update
    /// (or delete, if it is gone) so the edit still reaches the server.
    /// Call after every conflict of the batch has been resolved.
    pub fn reemit_uncovered(
        &self,
        conflicts: &[EntityConflict],
        clocks: &mut VectorClockService,
        app: &dyn ApplicationState,
        store: &dyn OperationLogStore,
    ) -> SyncResult<Vec<Operation>> {
        let covered: BTreeSet<&EntityKey> = conflicts.iter().map(|c| &c.key).collect();
        let mut seen = BTreeSet::new();
        let mut uncovered: BTreeMap<EntityKey, Timestamp> = BTreeMap::new();
        for op in conflicts.iter().flat_map(|c| &c.local_ops) {
            if !seen.insert(op.id) {
                continue;
            }
            for key in op.entity_keys() {
                if covered.contains(&key) {
                    continue;
                }
                let latest = uncovered.entry(key).or_insert(op.timestamp);
                *latest = (*latest).max(op.timestamp);
            }
        }

        let mut emitted = Vec::with_capacity(uncovered.len());
        for (key, timestamp) in uncovered {
            let me = clocks.client_id().clone();
            let clock = clocks.next_local_clock();
            let op = match app.get_current_entity_state(&key.entity_type, &key.entity_id) {
                Some(state) => Self::create_lww_update_op(
                    &key.entity_type,
                    &key.entity_id,
                    state,
                    me,
                    clock,
                    timestamp,
                ),
                None => Operation::new(
                    format!("[{}] Delete", key.entity_type),
                    OpType::Delete,
                    key.entity_type.clone(),
                    key.entity_id.clone(),
                    Value::Null,
                    me,
                    clock,
                )
                .with_timestamp(timestamp),
            };
            clocks.commit(store, &op, OpOrigin::Local)?;
            debug!("Re-emitted {} from a superseded local op", key);
            emitted.push(op);
        }
        Ok(emitted)
    }
}

fn group_by_entity(ops: &[Operation]) -> BTreeMap<EntityKey, Vec<&Operation>> {
    let mut groups: BTreeMap<EntityKey, Vec<&Operation>> = BTreeMap::new();
    for op in ops {
        for key in op.entity_keys() {
            groups.entry(key).or_default().push(op);
        }
    }
    groups
}

fn merged_clock(ops: &[&Operation]) -> VectorClock {
    let mut clock = VectorClock::new();
    for op in ops {
        clock.merge(&op.vector_clock);
    }
    clock
}
