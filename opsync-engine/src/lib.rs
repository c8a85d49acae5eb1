//! Offline-first operation log sync engine.
//!
//! Every local change is captured as an immutable [`Operation`](opsync_store::Operation)
//! stamped with a vector clock and logged before anything goes over the
//! wire. Sync cycles upload pending operations, apply whatever other
//! clients uploaded, and settle concurrent edits of the same entity with a
//! deterministic last-writer-wins rule so all devices converge.
//!
//! # Architecture
//!
//! - **Orchestrator**: drives upload, piggyback, rejection handling and
//!   download cycles ([`SyncOrchestrator`])
//! - **Worker**: serializes captures and coalesces sync triggers
//!   ([`SyncWorker`], [`OrchestratorHandle`])
//! - **Clock service**: the local identity, global clock and per-entity
//!   frontiers ([`VectorClockService`])
//! - **Resolution**: concurrent edits ([`ConflictResolutionService`]) and
//!   server-rejected stale operations ([`StaleOperationResolver`])
//! - **Re-baselining**: clean slates ([`CleanSlateService`]) and log
//!   compaction ([`CompactionService`])
//! - **Remotes**: anything implementing [`OperationSyncCapable`]: an HTTP
//!   server, a single versioned file in [`CloudStorage`], or the in-process
//!   [`MemorySyncServer`]
//!
//! # Sync cycle
//!
//! 1. **Upload**: pending operations go up in batches; full-state
//!    operations go up as snapshots
//! 2. **Piggyback**: operations the server returns with the upload
//!    response are applied before rejections are looked at
//! 3. **Rejections**: causally stale operations are rebuilt or discarded
//! 4. **Download**: pages of remote operations, or a snapshot when the
//!    server no longer has the requested history
//! 5. **Apply**: conflict detection, then application in log order
//!
//! # Example
//!
//! ```no_run
//! use opsync_engine::{MemoryApplicationState, MemorySyncServer, SyncConfig, SyncOrchestrator};
//! use opsync_store::MemoryOpLogStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> opsync_engine::SyncResult<()> {
//! let orchestrator = SyncOrchestrator::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryOpLogStore::new()),
//!     Arc::new(MemoryApplicationState::new()),
//!     Arc::new(MemorySyncServer::new()),
//! )?;
//! let report = orchestrator.sync().await?;
//! println!("uploaded {} ops", report.uploaded);
//! # Ok(())
//! # }
//! ```

pub mod applicator;
pub mod clean_slate;
pub mod clock_service;
pub mod cloud;
pub mod compaction;
pub mod config;
pub mod conflict;
pub mod decision;
pub mod encryption;
mod error;
pub mod migration;
mod orchestrator;
pub mod protocol;
pub mod remote;
pub mod stale;
pub mod state;
mod worker;

pub use applicator::{ApplicationState, MemoryApplicationState};
pub use clean_slate::{CleanSlateReason, CleanSlateService};
pub use clock_service::{EntityFrontier, LocalIdentity, VectorClockService};
pub use cloud::{CloudStorage, LocalFolderConfig, LocalFolderStorage, StoredFile};
pub use compaction::CompactionService;
pub use config::SyncConfig;
pub use conflict::{ConflictResolutionService, EntityConflict, Resolution, Winner};
pub use decision::{
    AutoDecisions, ConflictChoice, ConflictReason, FreshClientSummary, LocalRemoteConflict,
    UserDecisionProvider,
};
pub use encryption::EncryptionSettings;
pub use error::{SyncError, SyncResult};
pub use migration::{FnMigration, OperationMigration, SchemaMigrator};
pub use orchestrator::{LocalMutation, SyncOrchestrator};
pub use protocol::{
    DownloadOpsResponse, OpUploadResult, ServerOp, SnapshotUpload, SnapshotUploadResponse,
    UploadErrorCode, UploadOpsRequest, UploadOpsResponse,
};
pub use remote::{
    FileAdapterConfig, FileSyncAdapter, HttpEndpointConfig, HttpSyncEndpoint, MemorySyncServer,
    OperationSyncCapable, SyncFile,
};
pub use stale::{StaleOp, StaleOperationResolver, StaleResolution};
pub use state::{PauseReason, SyncEvent, SyncPhase, SyncReport};
pub use worker::{spawn_periodic, OrchestratorHandle, SyncWorker};
