//! Repair of local operations the server rejected as causally stale.
//!
//! Runs under the orchestrator's serialization lock: the caller lends the
//! clock service mutably for the whole pass so every rebuilt operation gets
//! a clock that dominates the previous one.

use crate::applicator::ApplicationState;
use crate::clock_service::VectorClockService;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use opsync_clock::VectorClock;
use opsync_store::{OpOrigin, OpType, Operation, OperationLogStore};
use opsync_types::{EntityKey, OpId, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// A rejected local operation, with the server's clock for the entity if it
/// sent one.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleOp {
    pub op: Operation,
    pub existing_clock: Option<VectorClock>,
}

/// What a resolver pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaleResolution {
    /// Operations re-emitted unchanged except for id and clock.
    pub reemitted: Vec<Operation>,
    /// LWW updates rebuilt from current entity state.
    pub rebuilt: Vec<Operation>,
    /// Entity changes that could not be rebuilt because the entity is gone.
    pub discarded: usize,
    pub superseded: Vec<OpId>,
    pub rejected: Vec<OpId>,
}

/// Rebuilds stale operations with dominating clocks.
#[derive(Debug, Clone)]
pub struct StaleOperationResolver {
    archival_action_types: Vec<String>,
}

impl StaleOperationResolver {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            archival_action_types: config.archival_action_types.clone(),
        }
    }

    fn is_self_sufficient(&self, op: &Operation) -> bool {
        op.is_full_state()
            || op.op_type == OpType::Delete
            || (op.op_type == OpType::Batch && op.payload.is_null())
            || self.archival_action_types.iter().any(|a| *a == op.action_type)
    }

    pub fn resolve(
        &self,
        stale: &[StaleOp],
        clocks: &mut VectorClockService,
        app: &dyn ApplicationState,
        store: &dyn OperationLogStore,
    ) -> SyncResult<StaleResolution> {
        let mut out = StaleResolution::default();
        if stale.is_empty() {
            return Ok(out);
        }

        for s in stale {
            clocks.observe(&s.op.vector_clock);
            if let Some(existing) = &s.existing_clock {
                clocks.observe(existing);
            }
        }

        let mut groups: BTreeMap<EntityKey, Vec<&Operation>> = BTreeMap::new();
        for s in stale {
            if self.is_self_sufficient(&s.op) {
                let mut op = s.op.clone();
                op.id = OpId::new();
                op.vector_clock = clocks.next_local_clock();
                clocks.commit(store, &op, OpOrigin::Local)?;
                debug!("Re-emitted {} as {}", s.op.id, op.id);
                out.superseded.push(s.op.id);
                out.reemitted.push(op);
            } else {
                for key in s.op.entity_keys() {
                    groups.entry(key).or_default().push(&s.op);
                }
            }
        }

        let mut rebuilt_any: BTreeSet<OpId> = BTreeSet::new();
        let mut grouped_ids: BTreeSet<OpId> = BTreeSet::new();
        for (key, ops) in groups {
            grouped_ids.extend(ops.iter().map(|op| op.id));
            let Some(state) = app.get_current_entity_state(&key.entity_type, &key.entity_id)
            else {
                warn!("Discarding {} stale change(s) to deleted {}", ops.len(), key);
                out.discarded += 1;
                continue;
            };

            let timestamp = ops
                .iter()
                .map(|op| op.timestamp)
                .max()
                .unwrap_or_else(Timestamp::now);
            let op = Operation::lww_update(
                &key.entity_type,
                &key.entity_id,
                state,
                clocks.client_id().clone(),
                clocks.next_local_clock(),
                timestamp,
            );
            clocks.commit(store, &op, OpOrigin::Local)?;
            rebuilt_any.extend(ops.iter().map(|op| op.id));
            out.rebuilt.push(op);
        }

        for id in grouped_ids {
            if rebuilt_any.contains(&id) {
                out.superseded.push(id);
            } else {
                out.rejected.push(id);
            }
        }

        store.mark_superseded(&out.superseded)?;
        store.mark_rejected(&out.rejected)?;
        info!(
            "Stale resolution: {} re-emitted, {} rebuilt, {} discarded",
            out.reemitted.len(),
            out.rebuilt.len(),
            out.discarded
        );
        Ok(out)
    }
}
