//! Operation log storage for the sync engine.
//!
//! # Architecture
//!
//! - [`Operation`] is the wire record every client and the server agree on
//! - The log keeps each operation once, with its local sequence number,
//!   origin and upload status ([`LogEntry`])
//! - A compacted [`StateSnapshot`] replaces folded history
//! - Sync metadata (global clock, protected client ids, identity, last
//!   server sequence) lives next to the log so it commits with it
//!
//! Two implementations of [`OperationLogStore`] are provided:
//! [`MemoryOpLogStore`] and the persistent [`SqliteOpLogStore`].

mod entry;
mod error;
mod memory;
mod operation;
mod sqlite;
mod store;

pub use entry::{EntryStatus, LogEntry, OpOrigin, StateSnapshot};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryOpLogStore;
pub use operation::{
    lww_action_label, OpType, Operation, ALL_ENTITY_TYPE, CURRENT_SCHEMA_VERSION,
};
pub use sqlite::SqliteOpLogStore;
pub use store::OperationLogStore;
