//! Blocking user decisions.
//!
//! The orchestrator never resolves these on its own: it suspends the cycle,
//! asks the [`UserDecisionProvider`], and on cancel leaves the log and clock
//! exactly as they were.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Shown before a fresh client accepts remote data for the first time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshClientSummary {
    pub provider: String,
    /// Remote operations waiting to be applied.
    pub remote_op_count: usize,
    /// True if the remote offers a full-state snapshot.
    pub has_snapshot: bool,
}

/// Why local and remote data cannot be merged automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictReason {
    /// A remote snapshot arrived while local user edits are pending.
    SnapshotWithLocalChanges,
    /// Another device imported or re-baselined state that the pending
    /// local edits do not build on.
    RemoteImport,
    /// A pending local import invalidates every incoming operation.
    LocalImportInvalidatesRemote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRemoteConflict {
    pub reason: ConflictReason,
    pub local_pending: usize,
    pub remote_count: usize,
}

/// Answer to a [`LocalRemoteConflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictChoice {
    /// Keep local data and overwrite the remote.
    UseLocal,
    /// Replace local data with the remote.
    UseRemote,
    /// Change nothing.
    Cancel,
}

/// Presents blocking choices to the user.
#[async_trait]
pub trait UserDecisionProvider: Send + Sync {
    /// Returns true if the fresh client may accept remote data.
    async fn confirm_fresh_client_sync(&self, summary: &FreshClientSummary) -> bool;

    async fn resolve_local_remote_conflict(&self, conflict: &LocalRemoteConflict)
        -> ConflictChoice;
}

/// Answers decisions from a script, recording what was asked.
///
/// Once the scripted answers run out, fresh-client prompts are confirmed
/// and conflicts are cancelled.
#[derive(Debug, Default)]
pub struct AutoDecisions {
    confirms: Mutex<VecDeque<bool>>,
    choices: Mutex<VecDeque<ConflictChoice>>,
    fresh_prompts: Mutex<Vec<FreshClientSummary>>,
    conflict_prompts: Mutex<Vec<LocalRemoteConflict>>,
}

impl AutoDecisions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn confirming(self, answer: bool) -> Self {
        if let Ok(mut q) = self.confirms.lock() {
            q.push_back(answer);
        }
        self
    }

    #[must_use]
    pub fn choosing(self, choice: ConflictChoice) -> Self {
        if let Ok(mut q) = self.choices.lock() {
            q.push_back(choice);
        }
        self
    }

    pub fn fresh_prompts(&self) -> Vec<FreshClientSummary> {
        self.fresh_prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn conflict_prompts(&self) -> Vec<LocalRemoteConflict> {
        self.conflict_prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl UserDecisionProvider for AutoDecisions {
    async fn confirm_fresh_client_sync(&self, summary: &FreshClientSummary) -> bool {
        if let Ok(mut p) = self.fresh_prompts.lock() {
            p.push(summary.clone());
        }
        self.confirms
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(true)
    }

    async fn resolve_local_remote_conflict(
        &self,
        conflict: &LocalRemoteConflict,
    ) -> ConflictChoice {
        if let Ok(mut p) = self.conflict_prompts.lock() {
            p.push(conflict.clone());
        }
        self.choices
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(ConflictChoice::Cancel)
    }
}
