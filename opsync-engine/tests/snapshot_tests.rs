mod common;

use async_trait::async_trait;
use common::Device;
use opsync_clock::VectorClock;
use opsync_engine::{
    AutoDecisions, ConflictChoice, ConflictReason, DownloadOpsResponse, OpUploadResult,
    OperationSyncCapable, PauseReason, ServerOp, SnapshotUpload, SnapshotUploadResponse,
    SyncResult, UploadErrorCode, UploadOpsResponse,
};
use opsync_store::{OpType, Operation, OperationLogStore};
use opsync_types::{ClientId, Timestamp};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A server that trimmed its history: downloads always serve a snapshot,
/// op uploads are throttled, snapshot uploads are accepted.
#[derive(Default)]
struct SnapshotServer {
    trailing: Vec<ServerOp>,
    snapshots: Mutex<Vec<SnapshotUpload>>,
}

impl SnapshotServer {
    fn with_trailing(op: Operation) -> Self {
        Self {
            trailing: vec![ServerOp {
                server_seq: 10,
                op,
                received_at: Timestamp::now(),
            }],
            ..Self::default()
        }
    }

    async fn snapshots(&self) -> Vec<SnapshotUpload> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl OperationSyncCapable for SnapshotServer {
    fn provider_name(&self) -> &'static str {
        "Snapshot"
    }

    async fn upload_ops(
        &self,
        ops: &[Operation],
        _client_id: &ClientId,
        _last_known_server_seq: u64,
    ) -> SyncResult<UploadOpsResponse> {
        Ok(UploadOpsResponse {
            results: ops
                .iter()
                .map(|op| OpUploadResult::rejected(op.id, UploadErrorCode::RateLimited, "slow down"))
                .collect(),
            latest_seq: 10,
            ..UploadOpsResponse::default()
        })
    }

    async fn download_ops(
        &self,
        _since_seq: u64,
        _exclude_client: Option<&ClientId>,
        _limit: Option<usize>,
    ) -> SyncResult<DownloadOpsResponse> {
        Ok(DownloadOpsResponse {
            ops: self.trailing.clone(),
            latest_seq: 10,
            snapshot_state: Some(json!({
                "task": { "r1": { "id": "r1", "title": "From snapshot", "isDone": true } }
            })),
            snapshot_vector_clock: Some(VectorClock::from_entries([("remote", 4)])),
            snapshot_schema_version: Some(1),
            ..DownloadOpsResponse::default()
        })
    }

    async fn upload_snapshot(&self, snapshot: &SnapshotUpload) -> SyncResult<SnapshotUploadResponse> {
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(SnapshotUploadResponse {
            accepted: true,
            server_seq: Some(11),
            error: None,
        })
    }
}

#[tokio::test]
async fn fresh_client_hydrates_from_snapshot() {
    let trailing = Operation::new(
        "[Task] Update",
        OpType::Update,
        "task",
        "r1",
        json!({ "title": "After snapshot" }),
        ClientId::from("remote"),
        VectorClock::from_entries([("remote", 5)]),
    );
    let server = Arc::new(SnapshotServer::with_trailing(trailing));
    let a = Device::new(server.clone());

    let report = a.sync.sync().await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(report.downloaded, 1);
    let prompt = &a.decisions.fresh_prompts()[0];
    assert!(prompt.has_snapshot);
    assert_eq!(prompt.provider, "Snapshot");
    assert_eq!(a.task("r1").unwrap()["title"], "After snapshot");
    assert_eq!(a.task("r1").unwrap()["isDone"], true);
    assert_eq!(a.store.get_last_server_seq().unwrap(), 10);
    assert!(a.store.load_snapshot().unwrap().is_some());

    let identity = a.sync.identity().await;
    assert_eq!(identity.clock().get(&ClientId::from("remote")), 5);
}

#[tokio::test]
async fn fresh_client_declining_snapshot_keeps_nothing() {
    let server = Arc::new(SnapshotServer::default());
    let a = Device::with_decisions(server.clone(), AutoDecisions::new().confirming(false));

    let report = a.sync.sync().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(a.app.count("task"), 0);
    assert_eq!(a.store.get_last_server_seq().unwrap(), 0);
}

#[tokio::test]
async fn snapshot_with_local_changes_cancel_keeps_local() {
    let server = Arc::new(SnapshotServer::default());
    let a = Device::with_decisions(
        server.clone(),
        AutoDecisions::new().choosing(ConflictChoice::Cancel),
    );
    a.create_task("t1", "Local work").await;

    let report = a.sync.sync().await.unwrap();

    assert!(report.cancelled);
    assert!(!report.replaced);
    let prompts = a.decisions.conflict_prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].reason, ConflictReason::SnapshotWithLocalChanges);
    assert_eq!(prompts[0].local_pending, 1);
    assert_eq!(prompts[0].remote_count, 1);

    assert!(a.task("r1").is_none());
    assert_eq!(a.task("t1").unwrap()["title"], "Local work");
    assert_eq!(a.pending(), 1);
    assert_eq!(a.sync.pause_reason().await, Some(PauseReason::RateLimited));
    assert!(server.snapshots().await.is_empty());
}

#[tokio::test]
async fn snapshot_with_local_changes_use_remote_discards_local() {
    let server = Arc::new(SnapshotServer::default());
    let a = Device::with_decisions(
        server.clone(),
        AutoDecisions::new().choosing(ConflictChoice::UseRemote),
    );
    a.create_task("t1", "Local work").await;

    let report = a.sync.sync().await.unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.applied, 1);
    assert!(a.task("t1").is_none());
    assert_eq!(a.task("r1").unwrap()["title"], "From snapshot");
    assert_eq!(a.pending(), 0);
    assert_eq!(a.store.get_last_server_seq().unwrap(), 10);
}

#[tokio::test]
async fn snapshot_with_local_changes_use_local_uploads_clean_slate() {
    let server = Arc::new(SnapshotServer::default());
    let a = Device::with_decisions(
        server.clone(),
        AutoDecisions::new().choosing(ConflictChoice::UseLocal),
    );
    a.create_task("t1", "Local work").await;
    let before = a.sync.client_id().await;

    let report = a.sync.sync().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert!(report.replaced);

    let snapshots = server.snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].is_clean_slate);
    assert_eq!(snapshots[0].state["task"]["t1"]["title"], "Local work");
    assert_ne!(snapshots[0].client_id, before);

    assert!(a.task("r1").is_none());
    assert_eq!(a.pending(), 0);
    assert_eq!(a.store.get_last_server_seq().unwrap(), 11);
}
