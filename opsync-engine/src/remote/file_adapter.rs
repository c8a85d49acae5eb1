//! Operation-log semantics on top of a single versioned file.
//!
//! The whole remote lives in one JSON document ([`SyncFile`]): the latest
//! full state, a window of recent operations and a sequence counter. Every
//! write is a read-modify-write guarded by the storage revision; a lost race
//! is retried from a fresh read. Entity-level conflicts are detected against
//! the recent-operations window, so the adapter rejects stale operations the
//! same way a native server does.

use super::OperationSyncCapable;
use crate::applicator::ApplicationState;
use crate::cloud::CloudStorage;
use crate::encryption::EncryptionSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    DownloadOpsResponse, OpUploadResult, ServerOp, SnapshotUpload, SnapshotUploadResponse,
    UploadErrorCode, UploadOpsResponse,
};
use async_trait::async_trait;
use opsync_clock::{CausalOrder, VectorClock, DEFAULT_MAX_CLOCK_SIZE};
use opsync_store::Operation;
use opsync_types::{ClientId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Current sync file format.
pub const SYNC_FILE_VERSION: u32 = 2;

/// File adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAdapterConfig {
    pub file_name: String,
    /// Operations kept in the window once they are covered by `state`.
    pub max_recent_ops: usize,
    /// Attempts per write when the revision moved underneath us.
    pub max_retries: usize,
    pub max_clock_size: usize,
}

impl Default for FileAdapterConfig {
    fn default() -> Self {
        Self {
            file_name: "sync-data.json".to_string(),
            max_recent_ops: 500,
            max_retries: 3,
            max_clock_size: DEFAULT_MAX_CLOCK_SIZE,
        }
    }
}

/// The single remote document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFile {
    pub format_version: u32,
    /// Bumped on every write.
    pub version: u64,
    pub schema_version: u32,
    /// Full state covering every operation up to `state_seq`.
    #[serde(default)]
    pub state: Option<Value>,
    pub state_seq: u64,
    /// Clock of `state`.
    pub vector_clock: VectorClock,
    pub recent_ops: Vec<ServerOp>,
    pub latest_seq: u64,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl SyncFile {
    fn empty(schema_version: u32) -> Self {
        Self {
            format_version: SYNC_FILE_VERSION,
            version: 0,
            schema_version,
            state: None,
            state_seq: 0,
            vector_clock: VectorClock::new(),
            recent_ops: Vec::new(),
            latest_seq: 0,
            is_encrypted: false,
        }
    }

    /// Lowest sequence the window can serve incrementally.
    fn window_start(&self) -> u64 {
        self.recent_ops
            .first()
            .map_or(self.latest_seq + 1, |op| op.server_seq)
    }

    fn push(&mut self, op: Operation) -> u64 {
        self.latest_seq += 1;
        self.recent_ops.push(ServerOp {
            server_seq: self.latest_seq,
            op,
            received_at: Timestamp::now(),
        });
        self.latest_seq
    }

    fn check(&self, op: &Operation, max: usize) -> Result<(), OpUploadResult> {
        if self.recent_ops.iter().any(|s| s.op.id == op.id) {
            return Err(OpUploadResult::rejected(
                op.id,
                UploadErrorCode::DuplicateOperation,
                "operation already stored",
            ));
        }
        for key in op.entity_keys() {
            let mut existing = VectorClock::new();
            for s in &self.recent_ops {
                if s.op.is_full_state() || s.op.entity_keys().contains(&key) {
                    existing.merge(&s.op.vector_clock);
                }
            }
            if existing.is_empty() {
                continue;
            }
            let code = match op.vector_clock.compare_with_limit(&existing, max) {
                CausalOrder::GreaterThan => continue,
                CausalOrder::Concurrent => UploadErrorCode::ConflictConcurrent,
                CausalOrder::LessThan | CausalOrder::Equal => UploadErrorCode::ConflictSuperseded,
            };
            return Err(OpUploadResult::rejected(op.id, code, format!("stale change to {key}"))
                .with_existing_clock(existing));
        }
        Ok(())
    }

    /// Drops covered operations beyond the window size. Never drops an
    /// operation the stored state does not include yet.
    fn trim(&mut self, max_recent_ops: usize) {
        let excess = self.recent_ops.len().saturating_sub(max_recent_ops);
        let covered = self
            .recent_ops
            .iter()
            .take_while(|s| s.server_seq <= self.state_seq)
            .count();
        let n = excess.min(covered);
        if n > 0 {
            self.recent_ops.drain(..n);
            debug!("Trimmed {} ops from the sync file window", n);
        }
    }
}

/// Provides the full state the adapter folds into the file after uploads.
struct StateSource {
    app: Arc<dyn ApplicationState>,
    encryption: EncryptionSettings,
}

/// [`OperationSyncCapable`] over one file in a [`CloudStorage`].
pub struct FileSyncAdapter {
    storage: Arc<dyn CloudStorage>,
    config: FileAdapterConfig,
    schema_version: u32,
    state_source: Option<StateSource>,
}

impl FileSyncAdapter {
    pub fn new(storage: Arc<dyn CloudStorage>, config: FileAdapterConfig, schema_version: u32) -> Self {
        Self {
            storage,
            config,
            schema_version,
            state_source: None,
        }
    }

    /// Lets the adapter refresh the stored state from `app` after uploads,
    /// which allows the operation window to be trimmed.
    #[must_use]
    pub fn with_state_provider(
        mut self,
        app: Arc<dyn ApplicationState>,
        encryption: EncryptionSettings,
    ) -> Self {
        self.state_source = Some(StateSource { app, encryption });
        self
    }

    /// Reads the current file, or an empty one if it does not exist yet.
    pub async fn load(&self) -> SyncResult<(SyncFile, Option<String>)> {
        match self.storage.read(&self.config.file_name).await? {
            Some(stored) => {
                let file: SyncFile = serde_json::from_slice(&stored.content)?;
                Ok((file, Some(stored.revision)))
            }
            None => Ok((SyncFile::empty(self.schema_version), None)),
        }
    }

    /// Read-modify-write with optimistic retries. `mutate` may run several
    /// times and must be deterministic given the file it is handed.
    async fn update<T>(
        &self,
        mut mutate: impl FnMut(&mut SyncFile) -> SyncResult<T> + Send,
    ) -> SyncResult<T>
    where
        T: Send,
    {
        let mut last_err = None;
        for attempt in 1..=self.config.max_retries {
            let (mut file, revision) = self.load().await?;
            let out = mutate(&mut file)?;
            file.version += 1;
            let bytes = serde_json::to_vec(&file)?;
            match self
                .storage
                .write(&self.config.file_name, &bytes, revision.as_deref())
                .await
            {
                Ok(_) => return Ok(out),
                Err(SyncError::RevisionConflict(msg)) => {
                    warn!("Sync file changed underneath us (attempt {}): {}", attempt, msg);
                    last_err = Some(SyncError::RevisionConflict(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::RevisionConflict("no attempts made".into())))
    }

    fn current_state(&self) -> SyncResult<Option<(Value, bool)>> {
        match &self.state_source {
            Some(src) => {
                let state = src.app.get_full_state_snapshot();
                src.encryption.encrypt_state(&state).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OperationSyncCapable for FileSyncAdapter {
    fn provider_name(&self) -> &'static str {
        self.storage.provider_name()
    }

    async fn upload_ops(
        &self,
        ops: &[Operation],
        client_id: &ClientId,
        last_known_server_seq: u64,
    ) -> SyncResult<UploadOpsResponse> {
        let state = self.current_state()?;
        let max_clock = self.config.max_clock_size;
        let max_recent = self.config.max_recent_ops;

        self.update(|file| {
            // Ops between what the uploader knows and the window start were
            // trimmed; it has to download the snapshot before it is current.
            let missed = last_known_server_seq + 1 < file.window_start();
            let mut results = Vec::with_capacity(ops.len());
            let mut accepted = HashSet::new();
            for op in ops {
                match file.check(op, max_clock) {
                    Ok(()) => {
                        let seq = file.push(op.clone());
                        accepted.insert(op.id);
                        results.push(OpUploadResult::accepted(op.id, seq));
                    }
                    Err(rejection) => results.push(rejection),
                }
            }

            let new_ops: Vec<ServerOp> = file
                .recent_ops
                .iter()
                .filter(|s| s.server_seq > last_known_server_seq)
                .filter(|s| s.op.client_id != *client_id && !accepted.contains(&s.op.id))
                .cloned()
                .collect();

            // The uploader's state only covers the file once it has seen
            // everything else in it.
            if let Some((state, encrypted)) = &state {
                if !missed && new_ops.is_empty() && !accepted.is_empty() {
                    file.state = Some(state.clone());
                    file.is_encrypted = *encrypted;
                    file.state_seq = file.latest_seq;
                    for s in &file.recent_ops {
                        file.vector_clock.merge(&s.op.vector_clock);
                    }
                }
            }
            file.trim(max_recent);

            Ok(UploadOpsResponse {
                results,
                latest_seq: file.latest_seq,
                new_ops,
                has_more_piggyback: missed,
            })
        })
        .await
    }

    async fn download_ops(
        &self,
        since_seq: u64,
        exclude_client: Option<&ClientId>,
        limit: Option<usize>,
    ) -> SyncResult<DownloadOpsResponse> {
        let (file, _) = self.load().await?;

        if since_seq > file.latest_seq {
            return Ok(DownloadOpsResponse {
                latest_seq: file.latest_seq,
                gap_detected: true,
                ..DownloadOpsResponse::default()
            });
        }

        let keep = |s: &&ServerOp| exclude_client.is_none_or(|c| s.op.client_id != *c);

        if since_seq + 1 < file.window_start() {
            if let Some(state) = &file.state {
                debug!(
                    "Window starts at {}, serving snapshot for since={}",
                    file.window_start(),
                    since_seq
                );
                return Ok(DownloadOpsResponse {
                    ops: file
                        .recent_ops
                        .iter()
                        .filter(|s| s.server_seq > file.state_seq)
                        .filter(keep)
                        .cloned()
                        .collect(),
                    has_more: false,
                    latest_seq: file.latest_seq,
                    gap_detected: false,
                    snapshot_state: Some(state.clone()),
                    snapshot_vector_clock: Some(file.vector_clock.clone()),
                    snapshot_is_encrypted: file.is_encrypted,
                    snapshot_schema_version: Some(file.schema_version),
                });
            }
        }

        let limit = limit.unwrap_or(usize::MAX);
        let mut ops: Vec<ServerOp> = file
            .recent_ops
            .iter()
            .filter(|s| s.server_seq > since_seq)
            .filter(keep)
            .cloned()
            .collect();
        let has_more = ops.len() > limit;
        ops.truncate(limit);

        Ok(DownloadOpsResponse {
            ops,
            has_more,
            latest_seq: file.latest_seq,
            ..DownloadOpsResponse::default()
        })
    }

    async fn upload_snapshot(
        &self,
        snapshot: &SnapshotUpload,
    ) -> SyncResult<SnapshotUploadResponse> {
        let op = snapshot.to_operation();
        let response = self
            .update(|file| {
                if snapshot.is_clean_slate {
                    file.recent_ops.clear();
                    file.vector_clock = VectorClock::new();
                } else if file.recent_ops.iter().any(|s| s.op.id == op.id) {
                    return Ok(SnapshotUploadResponse {
                        accepted: false,
                        server_seq: None,
                        error: Some("operation already stored".into()),
                    });
                }
                let seq = file.push(op.clone());
                file.state = Some(snapshot.state.clone());
                file.is_encrypted = snapshot.is_encrypted;
                file.state_seq = seq;
                file.schema_version = snapshot.schema_version;
                file.vector_clock.merge(&snapshot.vector_clock);
                Ok(SnapshotUploadResponse {
                    accepted: true,
                    server_seq: Some(seq),
                    error: None,
                })
            })
            .await?;
        if snapshot.is_clean_slate {
            info!("Sync file reset by clean slate from {}", snapshot.client_id);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_store::OpType;
    use serde_json::json;

    fn file_with(n: u64, state_seq: u64) -> SyncFile {
        let mut file = SyncFile::empty(1);
        for i in 0..n {
            file.push(Operation::new(
                "[Task] Update",
                OpType::Update,
                "task",
                format!("t{i}"),
                json!({}),
                ClientId::from("A"),
                VectorClock::from_entries([("A", i + 1)]),
            ));
        }
        file.state_seq = state_seq;
        file
    }

    #[test]
    fn trim_never_drops_uncovered_ops() {
        let mut file = file_with(10, 3);
        file.trim(2);
        assert_eq!(file.recent_ops.len(), 7);
        assert_eq!(file.window_start(), 4);
    }

    #[test]
    fn trim_respects_window_size() {
        let mut file = file_with(10, 10);
        file.trim(4);
        assert_eq!(file.recent_ops.len(), 4);
        assert_eq!(file.window_start(), 7);
    }
}
