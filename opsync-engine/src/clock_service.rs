//! Local causal identity and clock bookkeeping.
//!
//! [`LocalIdentity`] is the client id plus the global clock its next
//! operation builds on. It is owned by [`VectorClockService`], which also
//! tracks per-entity frontiers. The orchestrator keeps the service behind its
//! serialization lock and lends `&mut` access to every component that stamps
//! operations, so a clock is never read before the operation that advanced
//! it has been recorded.

use crate::error::SyncResult;
use opsync_clock::VectorClock;
use opsync_store::{EntryStatus, OpOrigin, Operation, OperationLogStore};
use opsync_types::{ClientId, EntityKey, Timestamp};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// A client's causal identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    client_id: ClientId,
    clock: VectorClock,
}

impl LocalIdentity {
    #[must_use]
    pub fn new(client_id: ClientId, clock: VectorClock) -> Self {
        Self { client_id, clock }
    }

    /// A brand new identity with clock `{id: 1}`.
    #[must_use]
    pub fn mint() -> Self {
        let client_id = ClientId::generate();
        let clock = VectorClock::initial(client_id.clone());
        Self { client_id, clock }
    }

    /// Reads the persisted identity, minting and persisting one if absent.
    pub fn load_or_create(store: &dyn OperationLogStore) -> SyncResult<Self> {
        let client_id = match store.get_client_id()? {
            Some(id) => id,
            None => {
                let id = ClientId::generate();
                store.set_client_id(&id)?;
                info!("Minted client id {}", id);
                id
            }
        };
        Ok(Self {
            client_id,
            clock: store.get_vector_clock()?,
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }
}

/// Causal knowledge about one entity since the last snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFrontier {
    /// Merge of the clocks of every operation touching the entity.
    pub clock: VectorClock,
    /// Timestamp of the latest operation, for last-writer-wins.
    pub last_timestamp: Timestamp,
    pub last_client: ClientId,
}

impl EntityFrontier {
    /// True if `(timestamp, client)` wins last-writer-wins against this frontier.
    #[must_use]
    pub fn loses_to(&self, timestamp: Timestamp, client: &ClientId) -> bool {
        (timestamp, client) > (self.last_timestamp, &self.last_client)
    }
}

/// Derives the global clock and per-entity frontiers.
#[derive(Debug)]
pub struct VectorClockService {
    identity: LocalIdentity,
    frontiers: HashMap<EntityKey, EntityFrontier>,
    protected: BTreeSet<ClientId>,
    max_size: usize,
}

impl VectorClockService {
    /// Creates a service around an identity with no recorded history.
    #[must_use]
    pub fn new(identity: LocalIdentity, max_size: usize) -> Self {
        Self {
            identity,
            frontiers: HashMap::new(),
            protected: BTreeSet::new(),
            max_size,
        }
    }

    /// Rebuilds from the store: snapshot clock merged with every logged
    /// operation after the snapshot.
    pub fn load(store: &dyn OperationLogStore, max_size: usize) -> SyncResult<Self> {
        let mut identity = LocalIdentity::load_or_create(store)?;
        let snapshot = store.load_snapshot()?;
        let after = snapshot.as_ref().map_or(0, |s| s.last_applied_op_seq);
        if let Some(s) = &snapshot {
            identity.clock.merge(&s.vector_clock);
        }

        let mut service = Self::new(identity, max_size);
        service.protected = store.get_protected_client_ids()?;

        let entries = store.get_ops_after_seq(after)?;
        // Rejected ops never reached the server and must not leak into
        // later causal comparisons.
        for entry in entries.iter().filter(|e| e.status != EntryStatus::Rejected) {
            service.identity.clock.merge(&entry.op.vector_clock);
            if !entry.op.is_full_state() {
                service.record_frontier(&entry.op);
            }
        }
        debug!(
            "Loaded clock service: {} clients, {} entity frontiers from {} ops",
            service.identity.clock.len(),
            service.frontiers.len(),
            entries.len()
        );
        Ok(service)
    }

    #[must_use]
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.identity.client_id
    }

    /// Snapshot clock merged with every applied or appended operation clock.
    #[must_use]
    pub fn get_current_global_clock(&self) -> &VectorClock {
        &self.identity.clock
    }

    #[must_use]
    pub fn entity_frontier(&self, key: &EntityKey) -> Option<&EntityFrontier> {
        self.frontiers.get(key)
    }

    #[must_use]
    pub fn protected_client_ids(&self) -> &BTreeSet<ClientId> {
        &self.protected
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// True when the local counter must be reset before stamping again.
    #[must_use]
    pub fn needs_counter_reset(&self) -> bool {
        self.identity.clock.needs_counter_reset(&self.identity.client_id)
    }

    /// Clock for the next local operation: global clock with our entry
    /// incremented, pruned to the size cap.
    #[must_use]
    pub fn next_local_clock(&self) -> VectorClock {
        let me = &self.identity.client_id;
        self.identity
            .clock
            .incremented(me)
            .limit_size(me, &self.protected, self.max_size)
    }

    /// Folds external causal knowledge (e.g. a server's existing clock)
    /// into the global clock.
    pub fn observe(&mut self, clock: &VectorClock) {
        self.identity.clock.merge(clock);
    }

    /// Records an operation that was just appended or applied.
    pub fn record(&mut self, op: &Operation) {
        self.identity.clock.merge(&op.vector_clock);
        if op.is_full_state() {
            self.frontiers.clear();
            self.protected = op.vector_clock.client_ids().cloned().collect();
        } else {
            self.record_frontier(op);
        }
    }

    /// Appends an operation and records it in one step.
    ///
    /// Full-state operations also persist their clock keys as the protected
    /// client ids.
    pub fn commit(
        &mut self,
        store: &dyn OperationLogStore,
        op: &Operation,
        origin: OpOrigin,
    ) -> SyncResult<u64> {
        let seq = store.append_with_clock_update(op, origin)?;
        self.record(op);
        if op.is_full_state() {
            store.set_protected_client_ids(&self.protected)?;
        }
        Ok(seq)
    }

    /// Replaces the identity (clean slate, force download) and drops all
    /// entity frontiers.
    pub fn reset(&mut self, identity: LocalIdentity) {
        self.identity = identity;
        self.frontiers.clear();
    }

    pub fn set_protected(&mut self, ids: BTreeSet<ClientId>) {
        self.protected = ids;
    }

    /// Adopts a remote full state's clock as the new baseline: merged into
    /// the global clock, its keys protected, entity frontiers dropped.
    pub fn adopt_baseline(&mut self, clock: &VectorClock) {
        self.identity.clock.merge(clock);
        self.protected = clock.client_ids().cloned().collect();
        self.frontiers.clear();
    }

    fn record_frontier(&mut self, op: &Operation) {
        for key in op.entity_keys() {
            match self.frontiers.get_mut(&key) {
                Some(frontier) => {
                    frontier.clock.merge(&op.vector_clock);
                    if frontier.loses_to(op.timestamp, &op.client_id) {
                        frontier.last_timestamp = op.timestamp;
                        frontier.last_client = op.client_id.clone();
                    }
                }
                None => {
                    self.frontiers.insert(
                        key,
                        EntityFrontier {
                            clock: op.vector_clock.clone(),
                            last_timestamp: op.timestamp,
                            last_client: op.client_id.clone(),
                        },
                    );
                }
            }
        }
    }
}
