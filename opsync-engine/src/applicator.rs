//! Application state collaborator.
//!
//! The engine reads entity state and applies operations through
//! [`ApplicationState`]; it never interprets payloads itself beyond
//! full-state operations. [`MemoryApplicationState`] keeps entities as
//! `{entityType: {entityId: object}}` JSON and is used by tests and headless
//! clients.

use crate::error::{SyncError, SyncResult};
use opsync_store::{OpType, Operation};
use serde_json::{Map, Value};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Read/apply hooks into the application's state.
pub trait ApplicationState: Send + Sync {
    /// Current full state of one entity, or `None` if it does not exist.
    fn get_current_entity_state(&self, entity_type: &str, entity_id: &str) -> Option<Value>;

    /// Complete application state, including archived data.
    fn get_full_state_snapshot(&self) -> Value;

    fn apply_operation(&self, op: &Operation) -> SyncResult<()>;

    /// Replaces all state.
    fn load_full_state(&self, state: Value) -> SyncResult<()>;

    fn reset_to_default(&self) -> SyncResult<()>;

    /// Best-effort backup taken before destructive re-baselines.
    fn backup(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// In-memory application state.
#[derive(Debug, Default)]
pub struct MemoryApplicationState {
    state: RwLock<Map<String, Value>>,
}

impl MemoryApplicationState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities of `entity_type`.
    #[must_use]
    pub fn count(&self, entity_type: &str) -> usize {
        self.state
            .read()
            .ok()
            .and_then(|s| s.get(entity_type).and_then(Value::as_object).map(Map::len))
            .unwrap_or(0)
    }

    /// Inserts or replaces an entity directly, bypassing the log.
    pub fn put(&self, entity_type: &str, entity_id: &str, value: Value) -> SyncResult<()> {
        let mut state = self.write()?;
        table_mut(&mut state, entity_type)?.insert(entity_id.to_owned(), value);
        Ok(())
    }

    fn write(&self) -> SyncResult<std::sync::RwLockWriteGuard<'_, Map<String, Value>>> {
        self.state
            .write()
            .map_err(|_| SyncError::Protocol("application state lock poisoned".into()))
    }
}

fn table_mut<'a>(
    state: &'a mut Map<String, Value>,
    entity_type: &str,
) -> SyncResult<&'a mut Map<String, Value>> {
    let slot = state
        .entry(entity_type.to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
        .ok_or_else(|| SyncError::Protocol(format!("entity table {entity_type} is not an object")))
}

/// Shallow-merges `patch` into `target`. Non-object patches replace.
fn patch_entity(target: &mut Value, patch: &Value) {
    if let (Some(t), Some(p)) = (target.as_object_mut(), patch.as_object()) {
        for (k, v) in p {
            t.insert(k.clone(), v.clone());
        }
        return;
    }
    *target = patch.clone();
}

impl ApplicationState for MemoryApplicationState {
    fn get_current_entity_state(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        self.state
            .read()
            .ok()?
            .get(entity_type)?
            .get(entity_id)
            .cloned()
    }

    fn get_full_state_snapshot(&self) -> Value {
        self.state
            .read()
            .map(|s| Value::Object(s.clone()))
            .unwrap_or_else(|_| Value::Object(Map::new()))
    }

    fn apply_operation(&self, op: &Operation) -> SyncResult<()> {
        if op.is_full_state() {
            return self.load_full_state(op.payload.clone());
        }
        if op.is_payload_encrypted {
            return Err(SyncError::Protocol(format!(
                "refusing to apply encrypted payload of op {}",
                op.id
            )));
        }

        debug!("Applying {} ({:?}) to {}", op.action_type, op.op_type, op.entity_type);
        let mut state = self.write()?;
        let table = table_mut(&mut state, &op.entity_type)?;

        match op.op_type {
            OpType::Create => {
                if let Some(id) = &op.entity_id {
                    table.insert(id.clone(), op.payload.clone());
                }
            }
            OpType::Update => {
                let Some(id) = &op.entity_id else {
                    warn!("Update op {} has no entity id", op.id);
                    return Ok(());
                };
                if op.is_lww_update() {
                    table.insert(id.clone(), op.payload.clone());
                } else {
                    let entry = table
                        .entry(id.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    patch_entity(entry, &op.payload);
                }
            }
            OpType::Delete => {
                for key in op.entity_keys() {
                    table.remove(&key.entity_id);
                }
            }
            OpType::Batch => {
                for key in op.entity_keys() {
                    if op.payload.is_null() {
                        table.remove(&key.entity_id);
                    } else if let Some(entity) = table.get_mut(&key.entity_id) {
                        patch_entity(entity, &op.payload);
                    }
                }
            }
            OpType::SyncImport => {}
        }
        Ok(())
    }

    fn load_full_state(&self, state: Value) -> SyncResult<()> {
        let Value::Object(map) = state else {
            return Err(SyncError::Protocol("full state must be a JSON object".into()));
        };
        *self.write()? = map;
        Ok(())
    }

    fn reset_to_default(&self) -> SyncResult<()> {
        self.write()?.clear();
        Ok(())
    }
}
