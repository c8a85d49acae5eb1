//! Folder-backed storage.
//!
//! Works on any directory, including ones a desktop client mirrors to a
//! cloud drive (iCloud Drive, Dropbox, a network share). Revisions are the
//! SHA-256 of the file content, so two writers that read the same content
//! agree on the revision without any side metadata.

use super::storage::{CloudStorage, StoredFile};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Local folder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalFolderConfig {
    /// Base directory, e.g. a cloud drive's mount point.
    pub root: PathBuf,
    /// Folder within `root` that holds sync files.
    pub sync_folder: String,
    /// Maximum file size accepted on write (in bytes).
    pub max_file_size: u64,
}

impl Default for LocalFolderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            sync_folder: "opsync/sync".to_string(),
            max_file_size: 50 * 1024 * 1024, // 50 MB
        }
    }
}

/// Folder-backed [`CloudStorage`].
pub struct LocalFolderStorage {
    config: LocalFolderConfig,
    sync_folder: RwLock<Option<PathBuf>>,
    /// Serializes check-then-write within this process.
    write_lock: Mutex<()>,
}

impl LocalFolderStorage {
    pub fn new(config: LocalFolderConfig) -> Self {
        Self {
            config,
            sync_folder: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Content revision: hex SHA-256.
    #[must_use]
    pub fn revision_of(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    /// Gets the sync folder path, creating it if necessary.
    async fn get_sync_folder(&self) -> SyncResult<PathBuf> {
        if let Some(path) = self.sync_folder.read().await.as_ref() {
            return Ok(path.clone());
        }

        let sync_folder = self.config.root.join(&self.config.sync_folder);
        if fs::metadata(&sync_folder).await.is_err() {
            fs::create_dir_all(&sync_folder).await.map_err(|e| {
                SyncError::CloudStorage(format!("failed to create sync folder: {e}"))
            })?;
            info!("Created sync folder: {:?}", sync_folder);
        }

        *self.sync_folder.write().await = Some(sync_folder.clone());
        Ok(sync_folder)
    }

    async fn path_for(&self, name: &str) -> SyncResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(SyncError::CloudStorage(format!("invalid file name: {name:?}")));
        }
        Ok(self.get_sync_folder().await?.join(name))
    }
}

#[async_trait]
impl CloudStorage for LocalFolderStorage {
    fn provider_name(&self) -> &'static str {
        "Local Folder"
    }

    async fn read(&self, name: &str) -> SyncResult<Option<StoredFile>> {
        let path = self.path_for(name).await?;
        match fs::read(&path).await {
            Ok(content) => {
                debug!("Read {:?} ({} bytes)", path, content.len());
                let revision = Self::revision_of(&content);
                Ok(Some(StoredFile { content, revision }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::CloudStorage(format!("failed to read file: {e}"))),
        }
    }

    async fn write(
        &self,
        name: &str,
        content: &[u8],
        expected_revision: Option<&str>,
    ) -> SyncResult<String> {
        if content.len() as u64 > self.config.max_file_size {
            return Err(SyncError::QuotaExceeded(format!(
                "{name} is {} bytes, limit is {}",
                content.len(),
                self.config.max_file_size
            )));
        }

        let _guard = self.write_lock.lock().await;
        let current = self.read(name).await?.map(|f| f.revision);
        if current.as_deref() != expected_revision {
            return Err(SyncError::RevisionConflict(format!(
                "{name}: expected {expected_revision:?}, found {current:?}"
            )));
        }

        let path = self.path_for(name).await?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| SyncError::CloudStorage(format!("failed to write file: {e}")))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SyncError::CloudStorage(format!("failed to replace file: {e}")))?;

        debug!("Wrote {:?} ({} bytes)", path, content.len());
        Ok(Self::revision_of(content))
    }

    async fn delete(&self, name: &str) -> SyncResult<()> {
        let path = self.path_for(name).await?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::CloudStorage(format!("failed to delete file: {e}"))),
        }
    }
}
