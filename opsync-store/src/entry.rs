//! Log entries, snapshots, and their bookkeeping enums.

use crate::error::StoreError;
use crate::operation::Operation;
use opsync_clock::VectorClock;
use opsync_types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Where a logged operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpOrigin {
    /// Produced by a local mutation.
    Local,
    /// A full-state operation that must be uploaded with a history wipe.
    CleanSlate,
    /// Received from the server.
    Remote,
}

/// Upload state of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Local and not yet acknowledged by the server.
    Pending,
    /// Acknowledged by the server, or received from it.
    Synced,
    /// Terminally rejected; never re-uploaded.
    Rejected,
    /// Replaced by a newer operation serving the same causal purpose.
    Superseded,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(StoreError::InvalidData(format!(
                        "unknown {}: {other}",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

str_enum!(OpOrigin { Local => "local", CleanSlate => "clean_slate", Remote => "remote" });
str_enum!(EntryStatus {
    Pending => "pending",
    Synced => "synced",
    Rejected => "rejected",
    Superseded => "superseded",
});

impl OpOrigin {
    /// Status a freshly appended entry starts in.
    #[must_use]
    pub const fn initial_status(&self) -> EntryStatus {
        match self {
            Self::Local | Self::CleanSlate => EntryStatus::Pending,
            Self::Remote => EntryStatus::Synced,
        }
    }
}

/// An operation as stored in the local log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub op: Operation,
    pub origin: OpOrigin,
    pub status: EntryStatus,
}

impl LogEntry {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }
}

/// Compacted application state.
///
/// `vector_clock` dominates every operation folded into `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state: Value,
    pub last_applied_op_seq: u64,
    pub vector_clock: VectorClock,
    pub compacted_at: Timestamp,
    pub schema_version: u32,
}
