//! In-process sync server.
//!
//! Implements the server half of the protocol: per-entity causal checks,
//! piggybacking, clean-slate history wipes and full-state baselines.
//! Failures and rejections can be injected for tests.

use super::OperationSyncCapable;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    DownloadOpsResponse, OpUploadResult, ServerOp, SnapshotUpload, SnapshotUploadResponse,
    UploadErrorCode, UploadOpsResponse,
};
use async_trait::async_trait;
use opsync_clock::{CausalOrder, VectorClock, DEFAULT_MAX_CLOCK_SIZE};
use opsync_store::Operation;
use opsync_types::{ClientId, EntityKey, OpId, Timestamp};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info};

const DEFAULT_PAGE: usize = 500;

#[derive(Default)]
struct ServerState {
    ops: Vec<ServerOp>,
    latest_seq: u64,
    seen: HashSet<OpId>,
    entity_clocks: HashMap<EntityKey, VectorClock>,
    /// Clock of the full-state operation every later op must follow.
    baseline: Option<VectorClock>,
    fail_next: VecDeque<SyncError>,
    reject_next: VecDeque<UploadErrorCode>,
}

impl ServerState {
    fn push(&mut self, op: Operation) -> u64 {
        self.latest_seq += 1;
        self.seen.insert(op.id);
        self.ops.push(ServerOp {
            server_seq: self.latest_seq,
            op,
            received_at: Timestamp::now(),
        });
        self.latest_seq
    }

    fn take_failure(&mut self) -> SyncResult<()> {
        match self.fail_next.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_baseline(&mut self, op: &Operation) {
        self.entity_clocks.clear();
        self.baseline = Some(op.vector_clock.clone());
    }

    fn check(&self, op: &Operation, max: usize) -> Result<(), OpUploadResult> {
        if self.seen.contains(&op.id) {
            return Err(OpUploadResult::rejected(
                op.id,
                UploadErrorCode::DuplicateOperation,
                "operation already stored",
            ));
        }
        if let Some(baseline) = &self.baseline {
            if !op.is_full_state()
                && op.vector_clock.compare_with_limit(baseline, max) != CausalOrder::GreaterThan
            {
                return Err(OpUploadResult::rejected(
                    op.id,
                    UploadErrorCode::ConflictSuperseded,
                    "operation does not follow the latest full-state import",
                )
                .with_existing_clock(baseline.clone()));
            }
        }
        for key in op.entity_keys() {
            let Some(existing) = self.entity_clocks.get(&key) else {
                continue;
            };
            let code = match op.vector_clock.compare_with_limit(existing, max) {
                CausalOrder::GreaterThan => continue,
                CausalOrder::Concurrent => UploadErrorCode::ConflictConcurrent,
                CausalOrder::LessThan | CausalOrder::Equal => UploadErrorCode::ConflictSuperseded,
            };
            return Err(OpUploadResult::rejected(op.id, code, format!("stale change to {key}"))
                .with_existing_clock(existing.clone()));
        }
        Ok(())
    }

    fn accept(&mut self, op: &Operation) -> u64 {
        if op.is_full_state() {
            self.set_baseline(op);
        } else {
            for key in op.entity_keys() {
                self.entity_clocks
                    .entry(key)
                    .or_default()
                    .merge(&op.vector_clock);
            }
        }
        self.push(op.clone())
    }
}

/// In-memory [`OperationSyncCapable`] server.
pub struct MemorySyncServer {
    state: Mutex<ServerState>,
    max_clock_size: usize,
    piggyback_limit: usize,
}

impl Default for MemorySyncServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySyncServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            max_clock_size: DEFAULT_MAX_CLOCK_SIZE,
            piggyback_limit: DEFAULT_PAGE,
        }
    }

    #[must_use]
    pub fn with_piggyback_limit(mut self, limit: usize) -> Self {
        self.piggyback_limit = limit;
        self
    }

    /// The next call to any endpoint method fails with `error`.
    pub async fn fail_next(&self, error: SyncError) {
        self.state.lock().await.fail_next.push_back(error);
    }

    /// The next uploaded operation is rejected with `code`.
    pub async fn reject_next_with(&self, code: UploadErrorCode) {
        self.state.lock().await.reject_next.push_back(code);
    }

    /// Drops all data, as if the server were replaced by an empty one.
    pub async fn reset(&self) {
        *self.state.lock().await = ServerState::default();
        info!("Memory sync server reset");
    }

    pub async fn stored_ops(&self) -> Vec<ServerOp> {
        self.state.lock().await.ops.clone()
    }

    pub async fn op_count(&self) -> usize {
        self.state.lock().await.ops.len()
    }

    pub async fn current_seq(&self) -> u64 {
        self.state.lock().await.latest_seq
    }

    pub async fn entity_clock(&self, key: &EntityKey) -> Option<VectorClock> {
        self.state.lock().await.entity_clocks.get(key).cloned()
    }
}

#[async_trait]
impl OperationSyncCapable for MemorySyncServer {
    fn provider_name(&self) -> &'static str {
        "Memory"
    }

    async fn upload_ops(
        &self,
        ops: &[Operation],
        client_id: &ClientId,
        last_known_server_seq: u64,
    ) -> SyncResult<UploadOpsResponse> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let mut results = Vec::with_capacity(ops.len());
        let mut accepted_now = HashSet::new();
        for op in ops {
            if let Some(code) = state.reject_next.pop_front() {
                results.push(OpUploadResult::rejected(op.id, code, "injected rejection"));
                continue;
            }
            match state.check(op, self.max_clock_size) {
                Ok(()) => {
                    let seq = state.accept(op);
                    accepted_now.insert(op.id);
                    results.push(OpUploadResult::accepted(op.id, seq));
                }
                Err(rejection) => {
                    debug!("Rejected {} with {:?}", op.id, rejection.error_code);
                    results.push(rejection);
                }
            }
        }

        let mut new_ops: Vec<ServerOp> = state
            .ops
            .iter()
            .filter(|s| s.server_seq > last_known_server_seq)
            .filter(|s| s.op.client_id != *client_id && !accepted_now.contains(&s.op.id))
            .cloned()
            .collect();
        let has_more_piggyback = new_ops.len() > self.piggyback_limit;
        new_ops.truncate(self.piggyback_limit);

        Ok(UploadOpsResponse {
            results,
            latest_seq: state.latest_seq,
            new_ops,
            has_more_piggyback,
        })
    }

    async fn download_ops(
        &self,
        since_seq: u64,
        exclude_client: Option<&ClientId>,
        limit: Option<usize>,
    ) -> SyncResult<DownloadOpsResponse> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        if since_seq > state.latest_seq {
            return Ok(DownloadOpsResponse {
                latest_seq: state.latest_seq,
                gap_detected: true,
                ..DownloadOpsResponse::default()
            });
        }

        let limit = limit.unwrap_or(DEFAULT_PAGE);
        let mut ops: Vec<ServerOp> = state
            .ops
            .iter()
            .filter(|s| s.server_seq > since_seq)
            .filter(|s| exclude_client.is_none_or(|c| s.op.client_id != *c))
            .cloned()
            .collect();
        let has_more = ops.len() > limit;
        ops.truncate(limit);

        Ok(DownloadOpsResponse {
            ops,
            has_more,
            latest_seq: state.latest_seq,
            ..DownloadOpsResponse::default()
        })
    }

    async fn upload_snapshot(
        &self,
        snapshot: &SnapshotUpload,
    ) -> SyncResult<SnapshotUploadResponse> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        if snapshot.is_clean_slate {
            state.ops.clear();
            state.seen.clear();
            state.entity_clocks.clear();
            info!(
                "Clean slate from {}: history wiped ({})",
                snapshot.client_id, snapshot.reason
            );
        } else if state.seen.contains(&snapshot.op_id) {
            return Ok(SnapshotUploadResponse {
                accepted: false,
                server_seq: None,
                error: Some("operation already stored".into()),
            });
        }

        let op = snapshot.to_operation();
        let seq = state.accept(&op);
        Ok(SnapshotUploadResponse {
            accepted: true,
            server_seq: Some(seq),
            error: None,
        })
    }
}
