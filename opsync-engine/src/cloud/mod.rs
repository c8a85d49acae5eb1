//! Single-file storage backends for file-based sync.
//!
//! A [`CloudStorage`] holds named blobs with opaque revisions. The
//! [`FileSyncAdapter`](crate::remote::FileSyncAdapter) keeps the whole sync
//! state in one such blob and relies on revision checks for optimistic
//! locking.

pub mod local_folder;
pub mod storage;

pub use local_folder::{LocalFolderConfig, LocalFolderStorage};
pub use storage::{CloudStorage, StoredFile};
