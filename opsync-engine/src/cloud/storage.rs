//! Cloud storage abstraction trait.

use crate::error::SyncResult;
use async_trait::async_trait;

/// A blob read from storage along with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub content: Vec<u8>,
    /// Opaque token that changes whenever the content changes.
    pub revision: String,
}

/// Named-blob storage with compare-and-swap writes.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// Returns the name of the storage provider.
    fn provider_name(&self) -> &'static str;

    /// Reads a file, or `None` if it does not exist.
    async fn read(&self, name: &str) -> SyncResult<Option<StoredFile>>;

    /// Writes a file if its current revision is `expected_revision`
    /// (`None` meaning the file must not exist yet). Returns the new
    /// revision, or [`SyncError::RevisionConflict`] if another writer got
    /// there first.
    ///
    /// [`SyncError::RevisionConflict`]: crate::error::SyncError::RevisionConflict
    async fn write(
        &self,
        name: &str,
        content: &[u8],
        expected_revision: Option<&str>,
    ) -> SyncResult<String>;

    /// Deletes a file. Deleting a missing file succeeds.
    async fn delete(&self, name: &str) -> SyncResult<()>;
}
