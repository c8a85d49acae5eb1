mod common;

use common::Device;
use opsync_engine::{
    AutoDecisions, ConflictChoice, ConflictReason, PauseReason, SyncConfig, SyncError, SyncEvent,
    MemorySyncServer, UploadErrorCode,
};
use opsync_store::{EntryStatus, OpType, OperationLogStore};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn fresh_client_cancel_changes_nothing() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();

    let b = Device::with_decisions(server.clone(), AutoDecisions::new().confirming(false));
    let report = b.sync.sync().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(b.app.count("task"), 0);
    assert_eq!(b.store.get_last_seq().unwrap(), 0);
    assert_eq!(b.store.get_last_server_seq().unwrap(), 0);
    assert!(b.sync.is_fresh_client().unwrap());

    let prompts = b.decisions.fresh_prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].remote_op_count, 1);
    assert_eq!(prompts[0].provider, "Memory");
}

#[tokio::test]
async fn fresh_client_is_asked_again_after_cancel() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();

    let b = Device::with_decisions(server.clone(), AutoDecisions::new().confirming(false));
    b.sync.sync().await.unwrap();
    let report = b.sync.sync().await.unwrap();

    assert!(!report.cancelled);
    assert_eq!(b.app.count("task"), 1);
    assert_eq!(b.decisions.fresh_prompts().len(), 2);
}

#[tokio::test]
async fn fresh_client_against_empty_server_is_not_asked() {
    let server = Arc::new(MemorySyncServer::new());
    let b = Device::new(server.clone());

    let report = b.sync.sync().await.unwrap();

    assert_eq!(report, opsync_engine::SyncReport::default());
    assert!(b.decisions.fresh_prompts().is_empty());
}

#[tokio::test]
async fn stale_change_to_deleted_entity_is_discarded_and_reported() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();

    // Entity is gone locally by the time the rejection comes back.
    let op = a
        .sync
        .capture(opsync_engine::LocalMutation::new(
            "[Task] Update",
            OpType::Update,
            "task",
            "ghost",
            json!({ "title": "Nobody home" }),
        ))
        .await
        .unwrap();
    server
        .reject_next_with(UploadErrorCode::ConflictSuperseded)
        .await;

    let mut events = a.sync.subscribe();
    let report = a.sync.sync().await.unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(
        a.store.get_entry(&op.id).unwrap().unwrap().status,
        EntryStatus::Rejected
    );
    assert!(!a.sync.has_pending_ops().unwrap());

    let mut discarded = None;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ChangesDiscarded { count } = event {
            discarded = Some(count);
        }
    }
    assert_eq!(discarded, Some(1));
}

#[tokio::test]
async fn stale_change_is_rebuilt_from_current_state() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();

    let op = a.update_task("t1", json!({ "isDone": true })).await;
    server
        .reject_next_with(UploadErrorCode::ConflictConcurrent)
        .await;

    let report = a.sync.sync().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.discarded, 0);
    assert!(!a.sync.has_pending_ops().unwrap());
    assert_eq!(
        a.store.get_entry(&op.id).unwrap().unwrap().status,
        EntryStatus::Superseded
    );

    let stored = server.stored_ops().await;
    let rebuilt = &stored.last().unwrap().op;
    assert_eq!(rebuilt.action_type, "[task] LWW Update");
    assert_eq!(rebuilt.payload["isDone"], true);
    assert_eq!(rebuilt.payload["title"], "Write docs");
    assert_eq!(rebuilt.timestamp, op.timestamp);
    assert!(rebuilt.vector_clock.dominates(&op.vector_clock));
}

#[tokio::test]
async fn stale_delete_is_reemitted() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();

    let delete = a
        .sync
        .capture(opsync_engine::LocalMutation::new(
            "[Task] Delete",
            OpType::Delete,
            "task",
            "t1",
            json!(null),
        ))
        .await
        .unwrap();
    server
        .reject_next_with(UploadErrorCode::ConflictSuperseded)
        .await;

    a.sync.sync().await.unwrap();

    let stored = server.stored_ops().await;
    let reemitted = &stored.last().unwrap().op;
    assert_eq!(reemitted.op_type, OpType::Delete);
    assert_ne!(reemitted.id, delete.id);
    assert_eq!(reemitted.timestamp, delete.timestamp);
}

#[tokio::test]
async fn duplicate_rejection_counts_as_synced() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let op = a.create_task("t1", "Write docs").await;
    server
        .reject_next_with(UploadErrorCode::DuplicateOperation)
        .await;

    a.sync.sync().await.unwrap();

    assert_eq!(
        a.store.get_entry(&op.id).unwrap().unwrap().status,
        EntryStatus::Synced
    );
}

#[tokio::test]
async fn validation_rejection_is_permanent() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let op = a.create_task("t1", "Write docs").await;
    server
        .reject_next_with(UploadErrorCode::ValidationError)
        .await;

    let report = a.sync.sync().await.unwrap();

    assert_eq!(report.rejected, 1);
    assert_eq!(
        a.store.get_entry(&op.id).unwrap().unwrap().status,
        EntryStatus::Rejected
    );
    assert!(!a.sync.has_pending_ops().unwrap());
}

#[tokio::test]
async fn authentication_failure_pauses_sync_until_resumed() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    server.fail_next(SyncError::Auth("token expired".into())).await;

    let mut events = a.sync.subscribe();
    let err = a.sync.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));
    assert_eq!(a.sync.pause_reason().await, Some(PauseReason::Authentication));

    let mut saw_auth = false;
    while let Ok(event) = events.try_recv() {
        saw_auth |= event == SyncEvent::AuthenticationRequired;
    }
    assert!(saw_auth);

    let err = a.sync.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Paused(PauseReason::Authentication)));
    assert_eq!(server.op_count().await, 0);

    a.sync.resume().await;
    let report = a.sync.sync().await.unwrap();
    assert_eq!(report.uploaded, 1);
}

#[tokio::test]
async fn rate_limit_pauses_upload_but_not_download() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let b = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();
    b.sync.sync().await.unwrap();

    b.create_task("t2", "Mine").await;
    server.reject_next_with(UploadErrorCode::RateLimited).await;
    b.sync.sync().await.unwrap();
    assert_eq!(b.sync.pause_reason().await, Some(PauseReason::RateLimited));
    assert!(b.sync.has_pending_ops().unwrap());

    a.create_task("t3", "Theirs").await;
    a.sync.sync().await.unwrap();
    let report = b.sync.sync().await.unwrap();
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 1);
    assert!(b.task("t3").is_some());

    b.sync.resume().await;
    let report = b.sync.sync().await.unwrap();
    assert_eq!(report.uploaded, 1);
}

#[tokio::test]
async fn network_failure_leaves_ops_pending() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    server
        .fail_next(SyncError::Network("connection reset".into()))
        .await;

    let err = a.sync.sync().await.unwrap_err();
    assert!(err.is_transient());
    assert!(a.sync.has_pending_ops().unwrap());
    assert_eq!(a.sync.pause_reason().await, None);

    a.sync.sync().await.unwrap();
    assert!(!a.sync.has_pending_ops().unwrap());
}

#[tokio::test]
async fn server_wipe_with_pending_ops_uploads_full_state() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();

    server.reset().await;
    let pending = a.create_task("t2", "After wipe").await;

    let report = a.sync.sync().await.unwrap();
    assert!(report.migration_handled);
    assert_eq!(
        a.store.get_entry(&pending.id).unwrap().unwrap().status,
        EntryStatus::Superseded
    );

    let stored = server.stored_ops().await;
    assert_eq!(stored.len(), 1);
    let import = &stored[0].op;
    assert!(import.is_full_state());
    assert_eq!(import.action_type, "[All] Server Migration");
    assert_eq!(import.payload["task"]["t1"]["title"], "Write docs");
    assert_eq!(import.payload["task"]["t2"]["title"], "After wipe");
    assert!(!a.sync.has_pending_ops().unwrap());
}

#[tokio::test]
async fn server_wipe_detected_by_gap_requires_reupload() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();
    server.reset().await;

    let report = a.sync.sync().await.unwrap();
    assert!(report.reupload_required);
    assert!(a.sync.has_pending_ops().unwrap());

    a.sync.sync().await.unwrap();
    let stored = server.stored_ops().await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].op.is_full_state());

    // A new device joins from the re-uploaded state.
    let b = Device::new(server.clone());
    b.sync.sync().await.unwrap();
    assert_eq!(b.task("t1").unwrap()["title"], "Write docs");
}

#[tokio::test]
async fn gap_on_non_empty_server_restarts_from_zero() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let b = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();
    b.sync.sync().await.unwrap();
    a.create_task("t2", "More").await;
    a.sync.sync().await.unwrap();

    b.store.set_last_server_seq(100).unwrap();
    let report = b.sync.sync().await.unwrap();

    assert_eq!(report.downloaded, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(b.app.count("task"), 2);
    assert_eq!(
        b.store.get_last_server_seq().unwrap(),
        server.current_seq().await
    );
}

#[tokio::test]
async fn remote_import_with_local_changes_asks_user() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let b = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();
    b.sync.sync().await.unwrap();

    a.sync
        .import_state(json!({ "task": { "t9": { "id": "t9", "title": "Imported" } } }))
        .await
        .unwrap();
    a.sync.sync().await.unwrap();

    b.update_task("t1", json!({ "isDone": true })).await;
    let report = b.sync.sync().await.unwrap();

    assert!(report.cancelled);
    let prompts = b.decisions.conflict_prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].reason, ConflictReason::RemoteImport);
    assert_eq!(prompts[0].local_pending, 1);
    // Cancel leaves local data as it was.
    assert_eq!(b.task("t1").unwrap()["isDone"], true);
    assert!(b.task("t9").is_none());
    assert!(b.sync.has_pending_ops().unwrap());
}

#[tokio::test]
async fn remote_import_choosing_remote_replaces_local() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let b = Device::with_decisions(
        server.clone(),
        AutoDecisions::new().choosing(ConflictChoice::UseRemote),
    );
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();
    b.sync.sync().await.unwrap();

    a.sync
        .import_state(json!({ "task": { "t9": { "id": "t9", "title": "Imported" } } }))
        .await
        .unwrap();
    a.sync.sync().await.unwrap();

    b.update_task("t1", json!({ "isDone": true })).await;
    let report = b.sync.sync().await.unwrap();

    assert!(report.replaced);
    assert!(!report.cancelled);
    assert_eq!(
        b.store.get_last_server_seq().unwrap(),
        server.current_seq().await
    );
    assert!(b.task("t1").is_none());
    assert_eq!(b.task("t9").unwrap()["title"], "Imported");
    assert!(!b.sync.has_pending_ops().unwrap());

    // Both sides now build on the import.
    b.update_task("t9", json!({ "isDone": true })).await;
    let report = b.sync.sync().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.rejected, 0);
    a.sync.sync().await.unwrap();
    assert_eq!(a.task("t9").unwrap()["isDone"], true);
}

#[tokio::test]
async fn choosing_remote_mid_download_ends_the_cycle() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let b = Device::with(
        server.clone(),
        SyncConfig {
            download_limit: 1,
            ..SyncConfig::default()
        },
        AutoDecisions::new().choosing(ConflictChoice::UseRemote),
    );
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();
    b.sync.sync().await.unwrap();

    // Keep B's edit pending while downloads continue.
    b.update_task("t1", json!({ "isDone": true })).await;
    server.reject_next_with(UploadErrorCode::RateLimited).await;
    b.sync.sync().await.unwrap();
    assert_eq!(b.sync.pause_reason().await, Some(PauseReason::RateLimited));

    a.sync
        .import_state(json!({ "task": { "t9": { "id": "t9", "title": "Imported" } } }))
        .await
        .unwrap();
    a.create_task("t10", "After import").await;
    a.create_task("t11", "Also after").await;
    a.sync.sync().await.unwrap();
    let latest = server.current_seq().await;

    let report = b.sync.sync().await.unwrap();

    assert!(report.replaced);
    // One page before the prompt, then the full replay; no further pages.
    assert_eq!(report.downloaded, 4);
    assert_eq!(b.store.get_last_server_seq().unwrap(), latest);
    assert!(b.task("t1").is_none());
    assert_eq!(b.task("t11").unwrap()["title"], "Also after");
    assert_eq!(b.pending(), 0);
}

#[tokio::test]
async fn remote_import_without_local_changes_applies_silently() {
    let server = Arc::new(MemorySyncServer::new());
    let a = Device::new(server.clone());
    let b = Device::new(server.clone());
    a.create_task("t1", "Write docs").await;
    a.sync.sync().await.unwrap();
    b.sync.sync().await.unwrap();

    a.sync
        .import_state(json!({ "task": { "t9": { "id": "t9", "title": "Imported" } } }))
        .await
        .unwrap();
    a.sync.sync().await.unwrap();
    b.sync.sync().await.unwrap();

    assert!(b.decisions.conflict_prompts().is_empty());
    assert!(b.task("t1").is_none());
    assert_eq!(b.task("t9").unwrap()["title"], "Imported");
}
