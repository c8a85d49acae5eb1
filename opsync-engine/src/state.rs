//! Sync cycle state: phases, pause reasons, cycle reports and notifications.

use opsync_types::ClientId;
use serde::{Deserialize, Serialize};

/// Where the orchestrator is within a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Uploading,
    ProcessingPiggyback,
    HandlingRejections,
    Downloading,
    ProcessingRemote,
    /// Blocked on a fresh-client confirmation or a local/remote choice.
    AwaitingUserDecision,
}

/// Why sync (or upload only) is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PauseReason {
    /// Credentials were refused; all sync stops until `resume()`.
    Authentication,
    /// Upload paused; downloads continue.
    StorageQuota,
    /// Upload paused; downloads continue.
    RateLimited,
}

impl PauseReason {
    /// True if only uploads are paused.
    #[must_use]
    pub fn upload_only(&self) -> bool {
        !matches!(self, Self::Authentication)
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub uploaded: usize,
    pub rejected: usize,
    pub piggybacked: usize,
    pub downloaded: usize,
    pub applied: usize,
    pub conflicts_resolved: usize,
    pub discarded: usize,
    pub migration_handled: bool,
    /// The server lost history; local state was re-queued for upload.
    pub reupload_required: bool,
    /// A user decision was cancelled; nothing was changed.
    pub cancelled: bool,
    /// A user decision replaced one side wholesale (force upload or force
    /// download); the rest of the cycle was skipped.
    pub replaced: bool,
    /// Another cycle was already running; this trigger did nothing.
    pub deferred: bool,
}

impl SyncReport {
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }

    /// True once nothing else should run in this cycle.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cancelled || self.replaced
    }
}

/// Notifications emitted to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    PendingOpsChanged { has_pending: bool },
    /// Local changes could not be rebuilt because their entity is gone.
    ChangesDiscarded { count: usize },
    /// The server only holds unencrypted data; local encryption was turned off.
    EncryptionDowngraded,
    AuthenticationRequired,
    UploadPaused(PauseReason),
    ConflictsResolved { count: usize },
    CleanSlateCompleted { new_client_id: ClientId },
    MigrationHandled,
}
