//! Sync protocol messages exchanged with a remote endpoint.
//!
//! The protocol is request/response over three calls:
//! 1. Upload pending operations; the server accepts or rejects each one and
//!    may piggyback operations other clients uploaded meanwhile
//! 2. Download operations after a server sequence number, or a full-state
//!    snapshot when the server no longer holds that history
//! 3. Upload a full-state snapshot, optionally wiping prior history
//!
//! All messages serialize in camelCase.

use opsync_clock::VectorClock;
use opsync_store::Operation;
use opsync_types::{ClientId, OpId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rejection codes a server attaches to a refused operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadErrorCode {
    /// The entity was changed concurrently by another client.
    ConflictConcurrent,
    /// The server already holds a causally newer change to the entity.
    ConflictSuperseded,
    DuplicateOperation,
    RateLimited,
    StorageQuotaExceeded,
    /// The operation failed server-side validation.
    ValidationError,
    #[serde(other)]
    Unknown,
}

impl UploadErrorCode {
    /// True for causal rejections the stale resolver can repair.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::ConflictConcurrent | Self::ConflictSuperseded)
    }
}

/// Per-operation upload outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpUploadResult {
    pub op_id: OpId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<UploadErrorCode>,
    /// The server's clock for the entity, sent with causal rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_clock: Option<VectorClock>,
}

impl OpUploadResult {
    #[must_use]
    pub fn accepted(op_id: OpId, server_seq: u64) -> Self {
        Self {
            op_id,
            accepted: true,
            server_seq: Some(server_seq),
            error: None,
            error_code: None,
            existing_clock: None,
        }
    }

    #[must_use]
    pub fn rejected(op_id: OpId, code: UploadErrorCode, error: impl Into<String>) -> Self {
        Self {
            op_id,
            accepted: false,
            server_seq: None,
            error: Some(error.into()),
            error_code: Some(code),
            existing_clock: None,
        }
    }

    #[must_use]
    pub fn with_existing_clock(mut self, clock: VectorClock) -> Self {
        self.existing_clock = Some(clock);
        self
    }
}

/// An operation as held by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOp {
    pub server_seq: u64,
    pub op: Operation,
    pub received_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOpsRequest {
    pub ops: Vec<Operation>,
    pub client_id: ClientId,
    pub last_known_server_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOpsResponse {
    pub results: Vec<OpUploadResult>,
    pub latest_seq: u64,
    /// Operations from other clients after `lastKnownServerSeq`.
    #[serde(default)]
    pub new_ops: Vec<ServerOp>,
    #[serde(default)]
    pub has_more_piggyback: bool,
}

/// Download page, or a snapshot when the requested history is gone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOpsResponse {
    #[serde(default)]
    pub ops: Vec<ServerOp>,
    #[serde(default)]
    pub has_more: bool,
    pub latest_seq: u64,
    /// The requested sequence is beyond what the server holds.
    #[serde(default)]
    pub gap_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_vector_clock: Option<VectorClock>,
    #[serde(default)]
    pub snapshot_is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_schema_version: Option<u32>,
}

impl DownloadOpsResponse {
    /// True if this response carries a full-state snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.snapshot_state.is_some()
    }
}

/// Full-state upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUpload {
    pub state: Value,
    pub client_id: ClientId,
    pub reason: String,
    pub vector_clock: VectorClock,
    pub schema_version: u32,
    #[serde(default)]
    pub is_encrypted: bool,
    pub op_id: OpId,
    /// Server must delete all prior history before accepting.
    #[serde(default)]
    pub is_clean_slate: bool,
    pub timestamp: Timestamp,
}

impl SnapshotUpload {
    /// The `SyncImport` operation this snapshot stands for.
    #[must_use]
    pub fn to_operation(&self) -> Operation {
        let mut op = Operation::full_state(
            self.reason.clone(),
            self.state.clone(),
            self.client_id.clone(),
            self.vector_clock.clone(),
        )
        .with_timestamp(self.timestamp)
        .with_schema_version(self.schema_version);
        op.id = self.op_id;
        op.is_payload_encrypted = self.is_encrypted;
        op
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUploadResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
