//! Failures surfaced by sync cycles, remotes and the worker.

use crate::state::PauseReason;
use opsync_crypto::CryptoError;
use opsync_store::StoreError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Everything a sync call can fail with. Remotes map their transport
/// failures onto these so the orchestrator can decide to pause or retry.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure or a 5xx from the remote.
    #[error("network error: {0}")]
    Network(String),

    /// A remote call exceeded the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// Credentials were refused (HTTP 401/403 or equivalent).
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Local operation log failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Failure in the file backend of a single-file remote.
    #[error("cloud storage error: {0}")]
    CloudStorage(String),

    #[error("payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Remote data uses a schema this build cannot read.
    #[error("schema version {version} is newer than supported version {supported}")]
    SchemaTooNew { version: u32, supported: u32 },

    #[error("migration error: {0}")]
    Migration(String),

    /// The remote answered with something that is not a valid response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Optimistic write lost against a concurrent writer.
    #[error("revision conflict: {0}")]
    RevisionConflict(String),

    #[error("sync paused: {0:?}")]
    Paused(PauseReason),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A sync cycle this request was coalesced into failed.
    #[error("coalesced sync cycle failed: {0}")]
    CycleFailed(String),

    /// The sync worker has shut down.
    #[error("sync worker is gone")]
    ChannelClosed,
}

impl SyncError {
    /// True for failures the next sync trigger may succeed on.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::RevisionConflict(_)
        )
    }
}

impl From<opsync_clock::Error> for SyncError {
    fn from(e: opsync_clock::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
