//! Value types shared by every opsync crate.
//!
//! Operations are named by a time-ordered [`OpId`], written by a [`ClientId`],
//! and address an [`EntityKey`]. [`Timestamp`] is wall-clock milliseconds and
//! only breaks ties; causality lives in the vector clock crate.
//!
//! Entity bodies stay opaque JSON to the engine.

mod ids;
mod timestamp;

pub use ids::{ClientId, EntityKey, OpId};
pub use timestamp::Timestamp;

pub type Result<T> = std::result::Result<T, Error>;

/// Parse failures for identifiers read from the wire or from a store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation id is not a UUID: {0}")]
    InvalidOpId(#[from] uuid::Error),

    /// Entity keys are written `type:id` with both halves non-empty.
    #[error("expected `type:id`, got {0:?}")]
    InvalidEntityKey(String),
}
