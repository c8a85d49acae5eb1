//! The sync orchestrator.
//!
//! One cycle runs `Idle → Uploading → ProcessingPiggyback →
//! HandlingRejections → Downloading → ProcessingRemote → Idle`, pausing in
//! `AwaitingUserDecision` where local and remote data cannot be merged
//! automatically.
//!
//! Two locks order all work:
//! - the clock lock (a `tokio::sync::Mutex` around [`VectorClockService`])
//!   guards every read-then-write of the log and clock; it is never held
//!   across a remote call or a user prompt
//! - the cycle lock admits one sync cycle at a time; a trigger that finds it
//!   taken returns a deferred report

use crate::applicator::ApplicationState;
use crate::clean_slate::{CleanSlateReason, CleanSlateService};
use crate::clock_service::{LocalIdentity, VectorClockService};
use crate::compaction::CompactionService;
use crate::config::SyncConfig;
use crate::conflict::ConflictResolutionService;
use crate::decision::{
    AutoDecisions, ConflictChoice, ConflictReason, FreshClientSummary, LocalRemoteConflict,
    UserDecisionProvider,
};
use crate::encryption::EncryptionSettings;
use crate::error::{SyncError, SyncResult};
use crate::migration::SchemaMigrator;
use crate::protocol::{DownloadOpsResponse, SnapshotUpload, UploadErrorCode, UploadOpsResponse};
use crate::remote::OperationSyncCapable;
use crate::stale::{StaleOp, StaleOperationResolver};
use crate::state::{PauseReason, SyncEvent, SyncPhase, SyncReport};
use opsync_clock::{CausalOrder, VectorClock};
use opsync_crypto::PayloadCipher;
use opsync_store::{
    LogEntry, OpOrigin, OpType, Operation, OperationLogStore, StateSnapshot,
};
use opsync_types::{ClientId, OpId, Timestamp};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Upload rounds per cycle; rebuilt stale operations go out in the next round.
const MAX_UPLOAD_ROUNDS: usize = 3;

const EVENT_CAPACITY: usize = 64;

/// A local state change to record in the log.
///
/// The application state is expected to already reflect the change.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMutation {
    pub action_type: String,
    pub op_type: OpType,
    pub entity_type: String,
    pub entity_ids: Vec<String>,
    pub payload: Value,
}

impl LocalMutation {
    pub fn new(
        action_type: impl Into<String>,
        op_type: OpType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            op_type,
            entity_type: entity_type.into(),
            entity_ids: vec![entity_id.into()],
            payload,
        }
    }

    /// A batch change to several entities of one type.
    pub fn batch(
        action_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_ids: Vec<String>,
        payload: Value,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            op_type: OpType::Batch,
            entity_type: entity_type.into(),
            entity_ids,
            payload,
        }
    }

    fn into_operation(
        self,
        client_id: ClientId,
        clock: VectorClock,
        schema_version: u32,
    ) -> SyncResult<Operation> {
        if self.op_type == OpType::SyncImport {
            return Err(SyncError::Protocol(
                "full-state changes go through import_state".into(),
            ));
        }
        let Some(first) = self.entity_ids.first().cloned() else {
            return Err(SyncError::Protocol(format!(
                "{} touches no entity",
                self.action_type
            )));
        };
        let is_batch = self.op_type == OpType::Batch;
        let op = Operation::new(
            self.action_type,
            self.op_type,
            self.entity_type,
            first,
            self.payload,
            client_id,
            clock,
        )
        .with_schema_version(schema_version);
        Ok(if is_batch {
            op.with_entity_ids(self.entity_ids)
        } else {
            op
        })
    }
}

/// Why a remote batch needs a decision before it may be applied.
enum RemoteGate {
    Clear,
    Ask(ConflictReason, usize),
}

/// Coordinates upload and download cycles against one remote endpoint.
pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<dyn OperationLogStore>,
    app: Arc<dyn ApplicationState>,
    endpoint: Arc<dyn OperationSyncCapable>,
    decisions: Arc<dyn UserDecisionProvider>,
    clocks: Mutex<VectorClockService>,
    cycle: Mutex<()>,
    encryption: RwLock<EncryptionSettings>,
    migrator: SchemaMigrator,
    conflicts: ConflictResolutionService,
    stale: StaleOperationResolver,
    clean_slate: CleanSlateService,
    compaction: CompactionService,
    pause: Mutex<Option<PauseReason>>,
    phase: watch::Sender<SyncPhase>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator, restoring identity and clocks from `store`.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn OperationLogStore>,
        app: Arc<dyn ApplicationState>,
        endpoint: Arc<dyn OperationSyncCapable>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let clocks = VectorClockService::load(store.as_ref(), config.max_vector_clock_size)?;
        info!(
            "Sync orchestrator for {} as client {}",
            endpoint.provider_name(),
            clocks.client_id()
        );
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            conflicts: ConflictResolutionService::new(config.max_vector_clock_size),
            stale: StaleOperationResolver::new(&config),
            clean_slate: CleanSlateService::new(config.schema_version),
            compaction: CompactionService::new(config.compaction_threshold, config.schema_version),
            migrator: SchemaMigrator::new(config.schema_version),
            clocks: Mutex::new(clocks),
            cycle: Mutex::new(()),
            encryption: RwLock::new(EncryptionSettings::disabled()),
            decisions: Arc::new(AutoDecisions::new()),
            pause: Mutex::new(None),
            phase,
            events,
            config,
            store,
            app,
            endpoint,
        })
    }

    #[must_use]
    pub fn with_decisions(mut self, decisions: Arc<dyn UserDecisionProvider>) -> Self {
        self.decisions = decisions;
        self
    }

    #[must_use]
    pub fn with_encryption(mut self, settings: EncryptionSettings) -> Self {
        self.encryption = RwLock::new(settings);
        self
    }

    #[must_use]
    pub fn with_migrator(mut self, migrator: SchemaMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub async fn client_id(&self) -> ClientId {
        self.clocks.lock().await.client_id().clone()
    }

    pub async fn identity(&self) -> LocalIdentity {
        self.clocks.lock().await.identity().clone()
    }

    pub async fn encryption_enabled(&self) -> bool {
        self.encryption.read().await.is_enabled()
    }

    pub async fn pause_reason(&self) -> Option<PauseReason> {
        *self.pause.lock().await
    }

    /// Clears any pause, e.g. after credentials were refreshed.
    pub async fn resume(&self) {
        if let Some(reason) = self.pause.lock().await.take() {
            info!("Sync resumed after {:?} pause", reason);
        }
    }

    /// True iff no snapshot exists and nothing was ever logged.
    pub fn is_fresh_client(&self) -> SyncResult<bool> {
        Ok(self.store.load_snapshot()?.is_none() && self.store.get_last_seq()? == 0)
    }

    pub fn has_pending_ops(&self) -> SyncResult<bool> {
        Ok(!self.store.get_unsynced_ops()?.is_empty())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, phase: SyncPhase) {
        if self.phase.send_replace(phase) != phase {
            debug!("Sync phase: {:?}", phase);
            self.emit(SyncEvent::PhaseChanged(phase));
        }
    }

    fn emit_pending(&self) -> SyncResult<()> {
        let has_pending = self.has_pending_ops()?;
        self.emit(SyncEvent::PendingOpsChanged { has_pending });
        Ok(())
    }

    async fn pause_upload(&self, reason: PauseReason) {
        let mut pause = self.pause.lock().await;
        if *pause != Some(PauseReason::Authentication) {
            *pause = Some(reason);
            warn!("Upload paused: {:?}", reason);
            self.emit(SyncEvent::UploadPaused(reason));
        }
    }

    /// Runs a remote call under the request timeout. Authentication
    /// failures pause sync.
    async fn remote<T>(&self, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        let result = match tokio::time::timeout(self.config.request_timeout(), call).await {
            Ok(r) => r,
            Err(_) => {
                warn!("Remote call timed out after {:?}", self.config.request_timeout());
                Err(SyncError::Timeout)
            }
        };
        match &result {
            Err(SyncError::Auth(msg)) => {
                warn!("Authentication failed, pausing sync: {}", msg);
                *self.pause.lock().await = Some(PauseReason::Authentication);
                self.emit(SyncEvent::AuthenticationRequired);
            }
            Err(SyncError::RateLimited(_)) => self.pause_upload(PauseReason::RateLimited).await,
            Err(SyncError::QuotaExceeded(_)) => self.pause_upload(PauseReason::StorageQuota).await,
            _ => {}
        }
        result
    }

    // ── Local capture ────────────────────────────────────────────

    /// Records a local mutation as a pending operation.
    pub async fn capture(&self, mutation: LocalMutation) -> SyncResult<Operation> {
        let mut clocks = self.clocks.lock().await;
        if clocks.needs_counter_reset() {
            warn!("Local counter near the safe limit, rotating identity");
            let op = self.clean_slate.create_clean_slate(
                CleanSlateReason::CounterReset,
                &mut clocks,
                self.app.as_ref(),
                self.store.as_ref(),
            )?;
            self.emit(SyncEvent::CleanSlateCompleted {
                new_client_id: op.client_id,
            });
        }

        let op = mutation.into_operation(
            clocks.client_id().clone(),
            clocks.next_local_clock(),
            self.config.schema_version,
        )?;
        clocks.commit(self.store.as_ref(), &op, OpOrigin::Local)?;
        drop(clocks);

        debug!("Captured {} on {}", op.action_type, op.entity_type);
        self.emit(SyncEvent::PendingOpsChanged { has_pending: true });
        Ok(op)
    }

    // ── Sync cycle ───────────────────────────────────────────────

    /// Runs one upload + download cycle.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Sync already running, deferring");
            return Ok(SyncReport::deferred());
        };
        if self.pause_reason().await == Some(PauseReason::Authentication) {
            return Err(SyncError::Paused(PauseReason::Authentication));
        }

        let mut report = SyncReport::default();
        let result = self.run_cycle(&mut report).await;
        self.set_phase(SyncPhase::Idle);
        result?;

        if let Err(e) = self.compact_if_needed().await {
            warn!("Compaction failed: {}", e);
        }
        info!(
            "Sync cycle done: {} up, {} down, {} applied, {} conflicts",
            report.uploaded, report.downloaded, report.applied, report.conflicts_resolved
        );
        Ok(report)
    }

    async fn run_cycle(&self, report: &mut SyncReport) -> SyncResult<()> {
        self.upload_phase(report).await?;
        if report.is_finished() {
            return Ok(());
        }
        self.download_phase(report).await
    }

    // ── Upload ───────────────────────────────────────────────────

    async fn upload_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        if self.is_fresh_client()? {
            debug!("Fresh client, skipping upload");
            return Ok(());
        }
        if let Some(reason) = self.pause_reason().await {
            debug!("Upload paused ({:?}), skipping", reason);
            return Ok(());
        }
        self.set_phase(SyncPhase::Uploading);
        self.check_server_migration(report).await?;

        for round in 0..MAX_UPLOAD_ROUNDS {
            let pending = self.store.get_unsynced_ops()?;
            if pending.is_empty() {
                break;
            }
            debug!("Upload round {}: {} pending", round + 1, pending.len());

            let (full, regular): (Vec<LogEntry>, Vec<LogEntry>) =
                pending.into_iter().partition(|e| e.op.is_full_state());
            for entry in &full {
                self.upload_full_state(entry, report).await?;
            }

            for chunk in regular.chunks(self.config.upload_batch_size) {
                if !self.is_upload_allowed().await || report.is_finished() {
                    break;
                }
                // Earlier chunks may have resolved some of these already.
                let chunk: Vec<&LogEntry> = chunk
                    .iter()
                    .filter(|e| matches!(self.store.get_entry(&e.op.id), Ok(Some(s)) if s.is_pending()))
                    .collect();
                if chunk.is_empty() {
                    continue;
                }
                let encryption = self.encryption.read().await.clone();
                let ops = chunk
                    .iter()
                    .map(|e| encryption.encrypt_operation(&e.op))
                    .collect::<SyncResult<Vec<_>>>()?;
                let me = self.client_id().await;
                let last_known = self.store.get_last_server_seq()?;
                let response = self
                    .remote(self.endpoint.upload_ops(&ops, &me, last_known))
                    .await?;
                self.handle_upload_response(&chunk, response, report).await?;
            }
            if report.is_finished() || !self.is_upload_allowed().await {
                break;
            }
        }

        self.emit_pending()
    }

    async fn is_upload_allowed(&self) -> bool {
        self.pause_reason().await.is_none()
    }

    /// Detects "this client has history, the server has none" and queues a
    /// full-state catch-up before anything else is uploaded.
    async fn check_server_migration(&self, report: &mut SyncReport) -> SyncResult<()> {
        if self.store.get_last_server_seq()? == 0 || !self.has_pending_ops()? {
            return Ok(());
        }
        let latest = self.remote(self.endpoint.latest_seq()).await?;
        if latest == 0 {
            self.handle_server_migration(report).await?;
        }
        Ok(())
    }

    async fn handle_server_migration(&self, report: &mut SyncReport) -> SyncResult<()> {
        let mut clocks = self.clocks.lock().await;
        let folded: Vec<OpId> = self
            .store
            .get_unsynced_ops()?
            .into_iter()
            .filter(|e| !e.op.is_full_state())
            .map(|e| e.op.id)
            .collect();
        self.store.mark_superseded(&folded)?;

        let op = Operation::full_state(
            "[All] Server Migration",
            self.app.get_full_state_snapshot(),
            clocks.client_id().clone(),
            clocks.next_local_clock(),
        )
        .with_schema_version(self.config.schema_version);
        clocks.commit(self.store.as_ref(), &op, OpOrigin::Local)?;
        self.store.set_last_server_seq(0)?;
        drop(clocks);

        info!("Server has no history, queued full-state catch-up {}", op.id);
        report.migration_handled = true;
        self.emit(SyncEvent::MigrationHandled);
        Ok(())
    }

    async fn upload_full_state(&self, entry: &LogEntry, report: &mut SyncReport) -> SyncResult<()> {
        let op = &entry.op;
        let is_clean_slate = entry.origin == OpOrigin::CleanSlate;
        let (state, is_encrypted) = self.encryption.read().await.encrypt_state(&op.payload)?;
        let snapshot = SnapshotUpload {
            state,
            client_id: op.client_id.clone(),
            reason: op.action_type.clone(),
            vector_clock: op.vector_clock.clone(),
            schema_version: op.schema_version,
            is_encrypted,
            op_id: op.id,
            is_clean_slate,
            timestamp: op.timestamp,
        };
        let response = self.remote(self.endpoint.upload_snapshot(&snapshot)).await?;

        if response.accepted {
            self.store.mark_synced(&[op.id])?;
            report.uploaded += 1;
            if is_clean_slate {
                if let Some(seq) = response.server_seq {
                    self.store.set_last_server_seq(seq)?;
                }
            }
            info!("Uploaded full state {} (clean slate: {})", op.id, is_clean_slate);
        } else {
            warn!(
                "Full state {} rejected: {}",
                op.id,
                response.error.as_deref().unwrap_or("no reason given")
            );
            self.store.mark_rejected(&[op.id])?;
            report.rejected += 1;
        }
        Ok(())
    }

    async fn handle_upload_response(
        &self,
        sent: &[&LogEntry],
        response: UploadOpsResponse,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let accepted: Vec<OpId> = response
            .results
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.op_id)
            .collect();
        self.store.mark_synced(&accepted)?;
        report.uploaded += accepted.len();

        // Piggybacked ops go first so conflicts are judged against local
        // ops that are still pending.
        if !response.new_ops.is_empty() {
            self.set_phase(SyncPhase::ProcessingPiggyback);
            report.piggybacked += response.new_ops.len();
            let ops = response.new_ops.into_iter().map(|s| s.op).collect();
            self.process_remote_ops(ops, report).await?;
            if report.is_finished() {
                return Ok(());
            }
        }
        if !response.has_more_piggyback {
            let current = self.store.get_last_server_seq()?;
            self.store
                .set_last_server_seq(current.max(response.latest_seq))?;
        }

        self.set_phase(SyncPhase::HandlingRejections);
        let by_id: HashMap<OpId, &LogEntry> = sent.iter().map(|e| (e.op.id, *e)).collect();
        let mut stale = Vec::new();
        let mut rejected = Vec::new();
        for result in response.results.into_iter().filter(|r| !r.accepted) {
            let Some(entry) = by_id.get(&result.op_id) else {
                warn!("Server answered for unknown op {}", result.op_id);
                continue;
            };
            match result.error_code {
                Some(UploadErrorCode::DuplicateOperation) => {
                    self.store.mark_synced(&[result.op_id])?;
                }
                Some(code) if code.is_stale() => {
                    // Piggyback resolution may already have superseded it.
                    let still_pending = self
                        .store
                        .get_entry(&result.op_id)?
                        .is_some_and(|e| e.is_pending());
                    if still_pending {
                        stale.push(StaleOp {
                            op: entry.op.clone(),
                            existing_clock: result.existing_clock,
                        });
                    }
                }
                Some(UploadErrorCode::RateLimited) => {
                    self.pause_upload(PauseReason::RateLimited).await;
                }
                Some(UploadErrorCode::StorageQuotaExceeded) => {
                    self.pause_upload(PauseReason::StorageQuota).await;
                }
                other => {
                    warn!(
                        "Op {} rejected ({:?}): {}",
                        result.op_id,
                        other,
                        result.error.as_deref().unwrap_or("no reason given")
                    );
                    rejected.push(result.op_id);
                }
            }
        }
        self.store.mark_rejected(&rejected)?;
        report.rejected += rejected.len() + stale.len();

        if !stale.is_empty() {
            let mut clocks = self.clocks.lock().await;
            let resolution =
                self.stale
                    .resolve(&stale, &mut clocks, self.app.as_ref(), self.store.as_ref())?;
            drop(clocks);
            if resolution.discarded > 0 {
                report.discarded += resolution.discarded;
                self.emit(SyncEvent::ChangesDiscarded {
                    count: resolution.discarded,
                });
            }
        }
        Ok(())
    }

    // ── Download ─────────────────────────────────────────────────

    async fn download_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        self.set_phase(SyncPhase::Downloading);
        let me = self.client_id().await;
        let mut since = self.store.get_last_server_seq()?;
        let mut restarted = false;
        let mut fresh_confirmed = false;

        loop {
            let response = self
                .remote(self.endpoint.download_ops(
                    since,
                    Some(&me),
                    Some(self.config.download_limit),
                ))
                .await?;

            if response.gap_detected {
                if response.latest_seq == 0 {
                    if self.is_fresh_client()? {
                        self.store.set_last_server_seq(0)?;
                    } else {
                        warn!("Server lost its history (since={}), re-uploading", since);
                        self.handle_server_migration(report).await?;
                        report.reupload_required = true;
                    }
                    return Ok(());
                }
                if restarted {
                    return Err(SyncError::Protocol(format!(
                        "server reports a gap at {} after restarting from 0",
                        since
                    )));
                }
                warn!("Gap detected at {}, restarting download from 0", since);
                since = 0;
                restarted = true;
                continue;
            }

            if response.is_snapshot() {
                return self.handle_snapshot(response, report).await;
            }

            if response.ops.is_empty() {
                if !response.has_more {
                    self.store.set_last_server_seq(response.latest_seq)?;
                }
                return Ok(());
            }

            if !fresh_confirmed && self.is_fresh_client()? {
                let summary = FreshClientSummary {
                    provider: self.endpoint.provider_name().to_string(),
                    remote_op_count: response.ops.len(),
                    has_snapshot: false,
                };
                if !self.confirm_fresh(&summary).await {
                    report.cancelled = true;
                    return Ok(());
                }
                fresh_confirmed = true;
            }

            let next = if response.has_more {
                response.ops.last().map_or(response.latest_seq, |s| s.server_seq)
            } else {
                response.latest_seq
            };
            report.downloaded += response.ops.len();
            let ops = response.ops.into_iter().map(|s| s.op).collect();
            self.process_remote_ops(ops, report).await?;
            if report.is_finished() {
                return Ok(());
            }
            // Only after the ops are durably logged.
            self.store.set_last_server_seq(next)?;

            if !response.has_more {
                return Ok(());
            }
            since = next;
        }
    }

    async fn confirm_fresh(&self, summary: &FreshClientSummary) -> bool {
        self.set_phase(SyncPhase::AwaitingUserDecision);
        info!(
            "Fresh client: asking before accepting {} remote ops",
            summary.remote_op_count
        );
        let ok = self.decisions.confirm_fresh_client_sync(summary).await;
        self.set_phase(SyncPhase::Downloading);
        ok
    }

    async fn ask(&self, reason: ConflictReason, local_pending: usize, remote_count: usize) -> ConflictChoice {
        self.set_phase(SyncPhase::AwaitingUserDecision);
        warn!(
            "Local/remote conflict ({:?}): {} local pending, {} remote",
            reason, local_pending, remote_count
        );
        let choice = self
            .decisions
            .resolve_local_remote_conflict(&LocalRemoteConflict {
                reason,
                local_pending,
                remote_count,
            })
            .await;
        info!("User chose {:?}", choice);
        choice
    }

    /// Applies a decision that replaces one side wholesale. Either way the
    /// current cycle ends: the report is finished afterwards.
    async fn apply_choice(&self, choice: ConflictChoice, report: &mut SyncReport) -> SyncResult<()> {
        match choice {
            ConflictChoice::UseLocal => self.force_upload_inner(report).await?,
            ConflictChoice::UseRemote => self.force_download_inner(report).await?,
            ConflictChoice::Cancel => {
                report.cancelled = true;
                return Ok(());
            }
        }
        report.replaced = true;
        Ok(())
    }

    fn user_authored_pending(&self) -> SyncResult<usize> {
        Ok(self
            .store
            .get_unsynced_ops()?
            .iter()
            .filter(|e| {
                e.op.is_full_state()
                    || (matches!(e.op.op_type, OpType::Create | OpType::Update)
                        && self.config.is_user_entity_type(&e.op.entity_type))
            })
            .count())
    }

    async fn handle_snapshot(&self, response: DownloadOpsResponse, report: &mut SyncReport) -> SyncResult<()> {
        let DownloadOpsResponse {
            ops,
            latest_seq,
            snapshot_state,
            snapshot_vector_clock,
            snapshot_is_encrypted,
            snapshot_schema_version,
            ..
        } = response;
        let Some(state) = snapshot_state else {
            return Ok(());
        };
        self.check_snapshot_encryption(snapshot_is_encrypted, ops.iter().map(|s| &s.op))
            .await;
        let state = self
            .encryption
            .read()
            .await
            .decrypt_state(state, snapshot_is_encrypted)?;
        let state = self.migrator.migrate_state(
            state,
            snapshot_schema_version.unwrap_or(self.config.schema_version),
        )?;
        let clock = snapshot_vector_clock.unwrap_or_default();

        if self.is_fresh_client()? {
            let summary = FreshClientSummary {
                provider: self.endpoint.provider_name().to_string(),
                remote_op_count: ops.len(),
                has_snapshot: true,
            };
            if !self.confirm_fresh(&summary).await {
                report.cancelled = true;
                return Ok(());
            }
        } else {
            let user_pending = self.user_authored_pending()?;
            if user_pending > 0 {
                let choice = self
                    .ask(ConflictReason::SnapshotWithLocalChanges, user_pending, ops.len() + 1)
                    .await;
                if choice != ConflictChoice::UseRemote {
                    self.apply_choice(choice, report).await?;
                    return Ok(());
                }
                self.store.clear_unsynced_ops()?;
            }
        }

        self.set_phase(SyncPhase::ProcessingRemote);
        {
            let mut clocks = self.clocks.lock().await;
            self.app.load_full_state(state)?;
            clocks.adopt_baseline(&clock);
            self.store.set_vector_clock(clocks.get_current_global_clock())?;
            self.store.set_protected_client_ids(clocks.protected_client_ids())?;
            self.store.save_snapshot(&StateSnapshot {
                state: self.app.get_full_state_snapshot(),
                last_applied_op_seq: self.store.get_last_seq()?,
                vector_clock: clocks.get_current_global_clock().clone(),
                compacted_at: Timestamp::now(),
                schema_version: self.config.schema_version,
            })?;
        }
        info!("Hydrated from remote snapshot at seq {}", latest_seq);
        report.applied += 1;

        report.downloaded += ops.len();
        self.process_remote_ops(ops.into_iter().map(|s| s.op).collect(), report)
            .await?;
        if !report.is_finished() {
            self.store.set_last_server_seq(latest_seq)?;
        }
        Ok(())
    }

    async fn check_encryption_mismatch(&self, raw: &[Operation]) {
        if !self.encryption.read().await.detects_downgrade(raw) {
            return;
        }
        *self.encryption.write().await = EncryptionSettings::disabled();
        warn!("Remote data is unencrypted while a key is configured; encryption disabled");
        self.emit(SyncEvent::EncryptionDowngraded);
    }

    async fn check_snapshot_encryption<'a>(
        &self,
        snapshot_is_encrypted: bool,
        trailing: impl IntoIterator<Item = &'a Operation>,
    ) {
        let downgrade = self
            .encryption
            .read()
            .await
            .detects_snapshot_downgrade(snapshot_is_encrypted, trailing);
        if !downgrade {
            return;
        }
        *self.encryption.write().await = EncryptionSettings::disabled();
        warn!("Remote snapshot is unencrypted while a key is configured; encryption disabled");
        self.emit(SyncEvent::EncryptionDowngraded);
    }

    /// Decrypts, migrates and de-duplicates incoming ops without touching
    /// the log.
    async fn prepare_incoming(&self, raw: Vec<Operation>) -> SyncResult<Vec<Operation>> {
        let encryption = self.encryption.read().await.clone();
        let mut incoming = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();
        for op in raw {
            if !seen.insert(op.id) || self.store.has_op(&op.id)? {
                continue;
            }
            let op = encryption.decrypt_operation(op)?;
            let op = self.migrator.migrate_operation(op)?;
            op.vector_clock.validate()?;
            incoming.push(op);
        }
        Ok(incoming)
    }

    /// Checks whether incoming full-state ops and pending local ops can
    /// coexist.
    fn gate_remote(&self, incoming: &[Operation]) -> SyncResult<RemoteGate> {
        let max = self.config.max_vector_clock_size;
        let pending = self.store.get_unsynced_ops()?;

        if let Some(import) = incoming.iter().rev().find(|op| op.is_full_state()) {
            let invalidated = pending
                .iter()
                .filter(|e| !e.op.is_full_state())
                .filter(|e| {
                    e.op.vector_clock.compare_with_limit(&import.vector_clock, max)
                        != CausalOrder::GreaterThan
                })
                .count();
            if invalidated > 0 {
                return Ok(RemoteGate::Ask(ConflictReason::RemoteImport, invalidated));
            }
        }

        if let Some(local) = pending.iter().find(|e| e.op.is_full_state()) {
            let all_invalid = incoming.iter().all(|op| {
                op.vector_clock.compare_with_limit(&local.op.vector_clock, max)
                    != CausalOrder::GreaterThan
            });
            if all_invalid {
                return Ok(RemoteGate::Ask(ConflictReason::LocalImportInvalidatesRemote, 1));
            }
        }
        Ok(RemoteGate::Clear)
    }

    /// Runs incoming ops through conflict detection and applies them.
    async fn process_remote_ops(&self, raw: Vec<Operation>, report: &mut SyncReport) -> SyncResult<()> {
        self.set_phase(SyncPhase::ProcessingRemote);
        if raw.is_empty() {
            return Ok(());
        }
        self.check_encryption_mismatch(&raw).await;
        let incoming = self.prepare_incoming(raw).await?;
        if incoming.is_empty() {
            return Ok(());
        }

        if let RemoteGate::Ask(reason, local) = self.gate_remote(&incoming)? {
            let choice = self.ask(reason, local, incoming.len()).await;
            self.apply_choice(choice, report).await?;
            return Ok(());
        }

        let pending: Vec<Operation> = self
            .store
            .get_unsynced_ops()?
            .into_iter()
            .map(|e| e.op)
            .collect();

        let mut clocks = self.clocks.lock().await;
        for op in &incoming {
            self.store.append_with_clock_update(op, OpOrigin::Remote)?;
        }

        let conflicts = self.conflicts.detect_conflicts(&pending, &incoming);
        let conflicted: HashSet<_> = conflicts.iter().map(|c| c.key.clone()).collect();

        for op in &incoming {
            if op.is_full_state() {
                self.app.apply_operation(op)?;
                clocks.record(op);
                self.store
                    .set_protected_client_ids(clocks.protected_client_ids())?;
                report.applied += 1;
                info!("Applied remote full state {} from {}", op.id, op.client_id);
                continue;
            }
            let keys = op.entity_keys();
            let open: Vec<&str> = keys
                .iter()
                .filter(|k| !conflicted.contains(*k))
                .map(|k| k.entity_id.as_str())
                .collect();
            if open.len() == keys.len() {
                if self.should_apply(&clocks, op) {
                    self.app.apply_operation(op)?;
                    report.applied += 1;
                } else {
                    debug!("Skipping remote op {}: already superseded locally", op.id);
                }
            } else if !open.is_empty() {
                // Conflicted entities are settled below; the rest apply now.
                let part = op.restricted_to(&open);
                if self.should_apply(&clocks, &part) {
                    self.app.apply_operation(&part)?;
                    report.applied += 1;
                }
            }
            clocks.record(op);
        }

        for conflict in &conflicts {
            self.conflicts
                .resolve(conflict, &mut clocks, self.app.as_ref(), self.store.as_ref())?;
            report.conflicts_resolved += 1;
        }
        self.conflicts.reemit_uncovered(
            &conflicts,
            &mut clocks,
            self.app.as_ref(),
            self.store.as_ref(),
        )?;
        drop(clocks);

        if !conflicts.is_empty() {
            self.emit(SyncEvent::ConflictsResolved {
                count: conflicts.len(),
            });
        }
        Ok(())
    }

    /// Frontier check for a remote op that is not in conflict with pending
    /// local work.
    fn should_apply(&self, clocks: &VectorClockService, op: &Operation) -> bool {
        let max = self.config.max_vector_clock_size;
        op.entity_keys()
            .iter()
            .all(|key| match clocks.entity_frontier(key) {
                None => true,
                Some(frontier) => match op.vector_clock.compare_with_limit(&frontier.clock, max) {
                    CausalOrder::GreaterThan => true,
                    CausalOrder::Concurrent => frontier.loses_to(op.timestamp, &op.client_id),
                    CausalOrder::LessThan | CausalOrder::Equal => false,
                },
            })
    }

    // ── Overrides ────────────────────────────────────────────────

    /// Keeps local data: clean slate under a new identity, uploaded with a
    /// server-side history wipe. Piggyback processing is skipped.
    pub async fn force_upload_local_state(&self) -> SyncResult<SyncReport> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            return Ok(SyncReport::deferred());
        };
        let mut report = SyncReport::default();
        let result = self.force_upload_inner(&mut report).await;
        self.set_phase(SyncPhase::Idle);
        result.map(|()| report)
    }

    async fn force_upload_inner(&self, report: &mut SyncReport) -> SyncResult<()> {
        self.set_phase(SyncPhase::Uploading);
        let op = {
            let mut clocks = self.clocks.lock().await;
            self.clean_slate.create_clean_slate(
                CleanSlateReason::ForceUpload,
                &mut clocks,
                self.app.as_ref(),
                self.store.as_ref(),
            )?
        };
        self.emit(SyncEvent::CleanSlateCompleted {
            new_client_id: op.client_id.clone(),
        });

        if let Some(entry) = self.store.get_entry(&op.id)? {
            self.upload_full_state(&entry, report).await?;
        }
        self.emit_pending()
    }

    /// Replaces local data with the remote: clears unsynced history, resets
    /// the clock to the remote's, and replays the remote from the start.
    pub async fn force_download_remote_state(&self) -> SyncResult<SyncReport> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            return Ok(SyncReport::deferred());
        };
        let mut report = SyncReport::default();
        let result = self.force_download_inner(&mut report).await;
        self.set_phase(SyncPhase::Idle);
        result.map(|()| report)
    }

    async fn force_download_inner(&self, report: &mut SyncReport) -> SyncResult<()> {
        self.set_phase(SyncPhase::Downloading);

        let mut raw = Vec::new();
        let mut snapshot: Option<(Value, VectorClock)> = None;
        let mut since = 0;
        let latest_seq = loop {
            let response = self
                .remote(self.endpoint.download_ops(since, None, Some(self.config.download_limit)))
                .await?;
            let latest = response.latest_seq;
            let next = response.ops.last().map(|s| s.server_seq);
            if let Some(state) = response.snapshot_state {
                self.check_snapshot_encryption(
                    response.snapshot_is_encrypted,
                    response.ops.iter().map(|s| &s.op),
                )
                .await;
                let state = self
                    .encryption
                    .read()
                    .await
                    .decrypt_state(state, response.snapshot_is_encrypted)?;
                let state = self.migrator.migrate_state(
                    state,
                    response
                        .snapshot_schema_version
                        .unwrap_or(self.config.schema_version),
                )?;
                snapshot = Some((state, response.snapshot_vector_clock.unwrap_or_default()));
                raw.extend(response.ops.into_iter().map(|s| s.op));
                break latest;
            }
            raw.extend(response.ops.into_iter().map(|s| s.op));
            match next {
                Some(seq) if response.has_more => since = seq,
                _ => break latest,
            }
        };

        // Prepare everything before touching local state.
        let encryption = self.encryption.read().await.clone();
        let ops = raw
            .into_iter()
            .map(|op| {
                let op = encryption.decrypt_operation(op)?;
                let op = self.migrator.migrate_operation(op)?;
                op.vector_clock.validate()?;
                Ok(op)
            })
            .collect::<SyncResult<Vec<_>>>()?;

        self.set_phase(SyncPhase::ProcessingRemote);
        let mut clocks = self.clocks.lock().await;
        let cleared = self.store.clear_unsynced_ops()?;

        let mut clock = snapshot
            .as_ref()
            .map(|(_, c)| c.clone())
            .unwrap_or_default();
        if snapshot.is_none() {
            for op in &ops {
                clock.merge(&op.vector_clock);
            }
        }
        let me = clocks.client_id().clone();
        self.store.set_vector_clock(&clock)?;
        clocks.reset(LocalIdentity::new(me, clock.clone()));

        match snapshot {
            Some((state, _)) => {
                self.app.load_full_state(state)?;
                clocks.adopt_baseline(&clock);
            }
            None if !ops.iter().any(Operation::is_full_state) => self.app.reset_to_default()?,
            None => {}
        }

        for op in &ops {
            self.store.append_with_clock_update(op, OpOrigin::Remote)?;
            self.app.apply_operation(op)?;
            clocks.record(op);
        }
        self.store
            .set_protected_client_ids(clocks.protected_client_ids())?;
        self.store.save_snapshot(&StateSnapshot {
            state: self.app.get_full_state_snapshot(),
            last_applied_op_seq: self.store.get_last_seq()?,
            vector_clock: clocks.get_current_global_clock().clone(),
            compacted_at: Timestamp::now(),
            schema_version: self.config.schema_version,
        })?;
        self.store.set_last_server_seq(latest_seq)?;
        drop(clocks);

        info!(
            "Force download: dropped {} local ops, replayed {} remote ops",
            cleared,
            ops.len()
        );
        report.downloaded += ops.len();
        report.applied += ops.len();
        self.emit_pending()
    }

    // ── Re-baselines ─────────────────────────────────────────────

    /// Runs a clean slate; the result is uploaded by the next sync.
    pub async fn clean_slate(&self, reason: CleanSlateReason) -> SyncResult<Operation> {
        let op = {
            let mut clocks = self.clocks.lock().await;
            self.clean_slate.create_clean_slate(
                reason,
                &mut clocks,
                self.app.as_ref(),
                self.store.as_ref(),
            )?
        };
        self.emit(SyncEvent::CleanSlateCompleted {
            new_client_id: op.client_id.clone(),
        });
        self.emit(SyncEvent::PendingOpsChanged { has_pending: true });
        Ok(op)
    }

    /// Replaces all state with `state` (restore from backup).
    pub async fn import_state(&self, state: Value) -> SyncResult<Operation> {
        let op = {
            let mut clocks = self.clocks.lock().await;
            self.clean_slate.create_clean_slate_from_import(
                state,
                CleanSlateReason::FullImport,
                &mut clocks,
                self.app.as_ref(),
                self.store.as_ref(),
            )?
        };
        self.emit(SyncEvent::PendingOpsChanged { has_pending: true });
        Ok(op)
    }

    pub async fn enable_encryption(&self, cipher: Arc<dyn PayloadCipher>) -> SyncResult<Operation> {
        *self.encryption.write().await = EncryptionSettings::enabled(cipher);
        self.clean_slate(CleanSlateReason::EncryptionEnabled).await
    }

    pub async fn disable_encryption(&self) -> SyncResult<Operation> {
        *self.encryption.write().await = EncryptionSettings::disabled();
        self.clean_slate(CleanSlateReason::EncryptionDisabled).await
    }

    /// Folds the log into a snapshot if it grew past the threshold.
    pub async fn compact_if_needed(&self) -> SyncResult<Option<StateSnapshot>> {
        let clocks = self.clocks.lock().await;
        self.compaction
            .compact_if_needed(&clocks, self.app.as_ref(), self.store.as_ref())
    }
}
