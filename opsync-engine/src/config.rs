//! Engine configuration.

use crate::error::{SyncError, SyncResult};
use opsync_clock::DEFAULT_MAX_CLOCK_SIZE;
use opsync_store::CURRENT_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum entries a vector clock may carry before pruning.
    pub max_vector_clock_size: usize,
    /// Maximum operations per upload request.
    pub upload_batch_size: usize,
    /// Maximum operations per download page.
    pub download_limit: usize,
    /// Timeout applied to every remote call (ms).
    pub request_timeout_ms: u64,
    /// Periodic sync interval; `None` disables the timer.
    pub sync_interval_secs: Option<u64>,
    /// Operations since the last snapshot that trigger compaction.
    pub compaction_threshold: usize,
    /// Schema version this client reads and writes.
    pub schema_version: u32,
    /// Entity types whose local edits block silent snapshot hydration.
    pub user_entity_types: Vec<String>,
    /// Action labels of bulk operations that remove entities from state.
    pub archival_action_types: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_vector_clock_size: DEFAULT_MAX_CLOCK_SIZE,
            upload_batch_size: 100,
            download_limit: 500,
            request_timeout_ms: 30_000,
            sync_interval_secs: None,
            compaction_threshold: 500,
            schema_version: CURRENT_SCHEMA_VERSION,
            user_entity_types: ["task", "project", "tag", "note"]
                .into_iter()
                .map(String::from)
                .collect(),
            archival_action_types: [
                "[Task] Move To Archive",
                "[Project] Archive",
                "[Archive] Flush Young To Old",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl SyncConfig {
    /// Loads a config from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {e}", path.as_ref().display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        let sizes = [
            ("max_vector_clock_size", self.max_vector_clock_size),
            ("upload_batch_size", self.upload_batch_size),
            ("download_limit", self.download_limit),
            ("compaction_threshold", self.compaction_threshold),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::Config(format!("{name} must be greater than zero")));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be greater than zero".into()));
        }
        if self.sync_interval_secs == Some(0) {
            return Err(SyncError::Config("sync_interval_secs must be greater than zero".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn is_user_entity_type(&self, entity_type: &str) -> bool {
        self.user_entity_types.iter().any(|t| t == entity_type)
    }

    #[must_use]
    pub fn is_archival_action(&self, action_type: &str) -> bool {
        self.archival_action_types.iter().any(|a| a == action_type)
    }
}
