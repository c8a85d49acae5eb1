//! Errors raised by operation log stores.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Why a log, snapshot or metadata call failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored operation, clock or snapshot no longer parses as JSON.
    #[error("stored record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another thread panicked while holding the in-memory log.
    #[error("operation log lock poisoned")]
    LockPoisoned,

    #[error("corrupt log row: {0}")]
    InvalidData(String),
}
