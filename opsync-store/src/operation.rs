//! The operation record exchanged between clients and the server.
//!
//! Field names and the `opType` codes are part of the wire contract: the
//! server compares clocks on exactly these fields, so every client must
//! serialize them identically.

use opsync_clock::VectorClock;
use opsync_types::{ClientId, EntityKey, OpId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version stamped on operations created by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Entity type used by full-state operations, which touch no single entity.
pub const ALL_ENTITY_TYPE: &str = "ALL";

/// Kind of mutation an operation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "CRT")]
    Create,
    #[serde(rename = "UPD")]
    Update,
    #[serde(rename = "DEL")]
    Delete,
    #[serde(rename = "BATCH")]
    Batch,
    #[serde(rename = "SYNC_IMPORT")]
    SyncImport,
}

/// A single logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OpId,
    /// Semantic label, e.g. `"[Task] Update"`.
    pub action_type: String,
    pub op_type: OpType,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    /// Opaque to the engine, except for full-state operations where it is
    /// the complete application state. A JSON string when encrypted.
    pub payload: Value,
    pub client_id: ClientId,
    pub vector_clock: VectorClock,
    pub timestamp: Timestamp,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_payload_encrypted: bool,
}

impl Operation {
    /// Creates an operation against a single entity, stamped now.
    #[must_use]
    pub fn new(
        action_type: impl Into<String>,
        op_type: OpType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        client_id: ClientId,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: OpId::new(),
            action_type: action_type.into(),
            op_type,
            entity_type: entity_type.into(),
            entity_id: Some(entity_id.into()),
            entity_ids: None,
            payload,
            client_id,
            vector_clock,
            timestamp: Timestamp::now(),
            schema_version: CURRENT_SCHEMA_VERSION,
            is_payload_encrypted: false,
        }
    }

    /// Creates a `SyncImport` operation carrying the whole application state.
    #[must_use]
    pub fn full_state(
        action_type: impl Into<String>,
        state: Value,
        client_id: ClientId,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: OpId::new(),
            action_type: action_type.into(),
            op_type: OpType::SyncImport,
            entity_type: ALL_ENTITY_TYPE.to_owned(),
            entity_id: None,
            entity_ids: None,
            payload: state,
            client_id,
            vector_clock,
            timestamp: Timestamp::now(),
            schema_version: CURRENT_SCHEMA_VERSION,
            is_payload_encrypted: false,
        }
    }

    /// Builds the whole-entity replacement used to settle conflicts.
    ///
    /// The payload is the entity's complete current state, so the operation
    /// is correct even if it is applied out of order relative to the
    /// operations it supersedes.
    #[must_use]
    pub fn lww_update(
        entity_type: &str,
        entity_id: &str,
        current_state: Value,
        client_id: ClientId,
        vector_clock: VectorClock,
        timestamp: Timestamp,
    ) -> Self {
        let mut op = Self::new(
            lww_action_label(entity_type),
            OpType::Update,
            entity_type,
            entity_id,
            current_state,
            client_id,
            vector_clock,
        );
        op.timestamp = timestamp;
        op
    }

    /// Replaces the single entity id with a list, for batch operations.
    #[must_use]
    pub fn with_entity_ids(mut self, ids: Vec<String>) -> Self {
        self.entity_id = None;
        self.entity_ids = Some(ids);
        self
    }

    /// Copy limited to the entities in `ids`. Lets the part of a batch that
    /// does not conflict be applied on its own; the copy is never logged.
    #[must_use]
    pub fn restricted_to(&self, ids: &[&str]) -> Self {
        let mut out = self.clone();
        out.entity_id = self
            .entity_id
            .clone()
            .filter(|id| ids.contains(&id.as_str()));
        out.entity_ids = self.entity_ids.as_ref().map(|all| {
            all.iter()
                .filter(|id| ids.contains(&id.as_str()))
                .cloned()
                .collect()
        });
        out
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// True for `SyncImport` operations (import, repair, clean slate).
    #[must_use]
    pub fn is_full_state(&self) -> bool {
        self.op_type == OpType::SyncImport
    }

    /// True when this is a whole-entity replacement built by conflict
    /// resolution; appliers must replace rather than patch the entity.
    #[must_use]
    pub fn is_lww_update(&self) -> bool {
        self.op_type == OpType::Update && self.action_type == lww_action_label(&self.entity_type)
    }

    /// One key per touched entity. Full-state operations touch none.
    #[must_use]
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        if self.is_full_state() {
            return Vec::new();
        }
        let mut keys = Vec::new();
        if let Some(id) = &self.entity_id {
            keys.push(EntityKey::new(self.entity_type.clone(), id.clone()));
        }
        if let Some(ids) = &self.entity_ids {
            keys.extend(
                ids.iter()
                    .map(|id| EntityKey::new(self.entity_type.clone(), id.clone())),
            );
        }
        keys
    }
}

/// Action label of last-writer-wins merge operations for `entity_type`.
#[must_use]
pub fn lww_action_label(entity_type: &str) -> String {
    format!("[{entity_type}] LWW Update")
}
