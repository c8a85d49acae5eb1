//! Schema migration of incoming operations and snapshot state.
//!
//! Each [`OperationMigration`] upgrades data from `from_version` to
//! `from_version + 1`. [`SchemaMigrator`] walks the chain until the data
//! reaches the version this build writes. Versions with no registered step
//! are bumped without transformation.

use crate::error::{SyncError, SyncResult};
use opsync_store::Operation;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One schema upgrade step.
pub trait OperationMigration: Send + Sync {
    fn from_version(&self) -> u32;

    fn migrate_operation(&self, op: Operation) -> SyncResult<Operation>;

    fn migrate_state(&self, state: Value) -> SyncResult<Value> {
        Ok(state)
    }
}

type OpFn = dyn Fn(Operation) -> SyncResult<Operation> + Send + Sync;
type StateFn = dyn Fn(Value) -> SyncResult<Value> + Send + Sync;

/// Migration step built from closures.
pub struct FnMigration {
    from_version: u32,
    op_fn: Box<OpFn>,
    state_fn: Option<Box<StateFn>>,
}

impl FnMigration {
    pub fn new(
        from_version: u32,
        op_fn: impl Fn(Operation) -> SyncResult<Operation> + Send + Sync + 'static,
    ) -> Self {
        Self {
            from_version,
            op_fn: Box::new(op_fn),
            state_fn: None,
        }
    }

    #[must_use]
    pub fn with_state(
        mut self,
        state_fn: impl Fn(Value) -> SyncResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.state_fn = Some(Box::new(state_fn));
        self
    }
}

impl fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMigration")
            .field("from_version", &self.from_version)
            .finish_non_exhaustive()
    }
}

impl OperationMigration for FnMigration {
    fn from_version(&self) -> u32 {
        self.from_version
    }

    fn migrate_operation(&self, op: Operation) -> SyncResult<Operation> {
        (self.op_fn)(op)
    }

    fn migrate_state(&self, state: Value) -> SyncResult<Value> {
        match &self.state_fn {
            Some(f) => f(state),
            None => Ok(state),
        }
    }
}

/// Ordered chain of migration steps up to `current`.
#[derive(Clone)]
pub struct SchemaMigrator {
    current: u32,
    steps: BTreeMap<u32, Arc<dyn OperationMigration>>,
}

impl fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaMigrator")
            .field("current", &self.current)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaMigrator {
    #[must_use]
    pub fn new(current: u32) -> Self {
        Self {
            current,
            steps: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: impl OperationMigration + 'static) -> Self {
        self.steps.insert(step.from_version(), Arc::new(step));
        self
    }

    #[must_use]
    pub fn current_version(&self) -> u32 {
        self.current
    }

    fn check(&self, version: u32) -> SyncResult<()> {
        if version > self.current {
            return Err(SyncError::SchemaTooNew {
                version,
                supported: self.current,
            });
        }
        Ok(())
    }

    /// Upgrades an operation to the current version. Full-state operations
    /// have their payload migrated as state.
    pub fn migrate_operation(&self, mut op: Operation) -> SyncResult<Operation> {
        self.check(op.schema_version)?;
        while op.schema_version < self.current {
            let from = op.schema_version;
            if let Some(step) = self.steps.get(&from) {
                op = if op.is_full_state() {
                    let payload = std::mem::take(&mut op.payload);
                    op.payload = step.migrate_state(payload)?;
                    op
                } else {
                    step.migrate_operation(op)?
                };
            }
            op.schema_version = from + 1;
            debug!("Migrated op {} from schema {} to {}", op.id, from, from + 1);
        }
        Ok(op)
    }

    /// Upgrades snapshot state written at `version`.
    pub fn migrate_state(&self, mut state: Value, version: u32) -> SyncResult<Value> {
        self.check(version)?;
        for v in version..self.current {
            if let Some(step) = self.steps.get(&v) {
                state = step.migrate_state(state)?;
            }
        }
        Ok(state)
    }
}
