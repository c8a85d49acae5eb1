#![allow(dead_code)]

use opsync_engine::{
    ApplicationState, AutoDecisions, EncryptionSettings, LocalMutation, MemoryApplicationState,
    OperationSyncCapable, SyncConfig, SyncOrchestrator,
};
use opsync_store::{MemoryOpLogStore, OpType, Operation, OperationLogStore};
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes engine logs to the test output; `RUST_LOG=opsync_engine=debug`
/// shows each sync phase.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One simulated client: its log, its application state and its engine.
pub struct Device {
    pub store: Arc<MemoryOpLogStore>,
    pub app: Arc<MemoryApplicationState>,
    pub decisions: Arc<AutoDecisions>,
    pub sync: SyncOrchestrator,
}

impl Device {
    pub fn new(remote: Arc<dyn OperationSyncCapable>) -> Self {
        Self::with(remote, SyncConfig::default(), AutoDecisions::new())
    }

    pub fn with_decisions(remote: Arc<dyn OperationSyncCapable>, decisions: AutoDecisions) -> Self {
        Self::with(remote, SyncConfig::default(), decisions)
    }

    pub fn with(
        remote: Arc<dyn OperationSyncCapable>,
        config: SyncConfig,
        decisions: AutoDecisions,
    ) -> Self {
        Self::build(
            Arc::new(MemoryApplicationState::new()),
            remote,
            config,
            decisions,
            EncryptionSettings::disabled(),
        )
    }

    pub fn encrypted(remote: Arc<dyn OperationSyncCapable>, encryption: EncryptionSettings) -> Self {
        Self::build(
            Arc::new(MemoryApplicationState::new()),
            remote,
            SyncConfig::default(),
            AutoDecisions::new(),
            encryption,
        )
    }

    pub fn build(
        app: Arc<MemoryApplicationState>,
        remote: Arc<dyn OperationSyncCapable>,
        config: SyncConfig,
        decisions: AutoDecisions,
        encryption: EncryptionSettings,
    ) -> Self {
        init_tracing();
        let store = Arc::new(MemoryOpLogStore::new());
        let decisions = Arc::new(decisions);
        let sync = SyncOrchestrator::new(config, store.clone(), app.clone(), remote)
            .unwrap()
            .with_decisions(decisions.clone())
            .with_encryption(encryption);
        Self {
            store,
            app,
            decisions,
            sync,
        }
    }

    pub async fn create_task(&self, id: &str, title: &str) -> Operation {
        let task = json!({ "id": id, "title": title, "isDone": false });
        self.app.put("task", id, task.clone()).unwrap();
        self.sync
            .capture(LocalMutation::new("[Task] Add", OpType::Create, "task", id, task))
            .await
            .unwrap()
    }

    pub async fn update_task(&self, id: &str, patch: Value) -> Operation {
        let mut task = self.task(id).unwrap_or_else(|| json!({ "id": id }));
        for (k, v) in patch.as_object().unwrap() {
            task[k] = v.clone();
        }
        self.app.put("task", id, task).unwrap();
        self.sync
            .capture(LocalMutation::new("[Task] Update", OpType::Update, "task", id, patch))
            .await
            .unwrap()
    }

    /// Marks several tasks done with one batch op.
    pub async fn complete_tasks(&self, ids: &[&str]) -> Operation {
        for id in ids {
            let mut task = self.task(id).unwrap();
            task["isDone"] = json!(true);
            self.app.put("task", id, task).unwrap();
        }
        self.sync
            .capture(LocalMutation::batch(
                "[Task] Bulk Done",
                "task",
                ids.iter().map(|id| id.to_string()).collect(),
                json!({ "isDone": true }),
            ))
            .await
            .unwrap()
    }

    pub fn task(&self, id: &str) -> Option<Value> {
        self.app.get_current_entity_state("task", id)
    }

    pub fn pending(&self) -> usize {
        self.store.get_unsynced_ops().unwrap().len()
    }
}

/// Sleeps long enough for the next operation to get a later timestamp.
pub async fn tick() {
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
}
