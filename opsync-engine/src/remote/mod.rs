//! Remote sync endpoints.
//!
//! Every provider is driven through [`OperationSyncCapable`]:
//!
//! - [`HttpSyncEndpoint`]: a server that stores an operation log natively
//! - [`FileSyncAdapter`]: per-operation semantics simulated on one
//!   versioned file in a [`CloudStorage`](crate::cloud::CloudStorage)
//! - [`MemorySyncServer`]: in-process server for tests and demos

pub mod file_adapter;
pub mod http;
pub mod memory;

pub use file_adapter::{FileAdapterConfig, FileSyncAdapter, SyncFile};
pub use http::{HttpEndpointConfig, HttpSyncEndpoint};
pub use memory::MemorySyncServer;

use crate::error::SyncResult;
use crate::protocol::{
    DownloadOpsResponse, SnapshotUpload, SnapshotUploadResponse, UploadOpsResponse,
};
use async_trait::async_trait;
use opsync_store::Operation;
use opsync_types::ClientId;

/// A remote that accepts and serves operations.
#[async_trait]
pub trait OperationSyncCapable: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Uploads operations. The response may piggyback operations other
    /// clients stored after `last_known_server_seq`.
    async fn upload_ops(
        &self,
        ops: &[Operation],
        client_id: &ClientId,
        last_known_server_seq: u64,
    ) -> SyncResult<UploadOpsResponse>;

    /// Downloads operations with `server_seq > since_seq`.
    async fn download_ops(
        &self,
        since_seq: u64,
        exclude_client: Option<&ClientId>,
        limit: Option<usize>,
    ) -> SyncResult<DownloadOpsResponse>;

    async fn upload_snapshot(&self, snapshot: &SnapshotUpload)
        -> SyncResult<SnapshotUploadResponse>;

    /// Latest server sequence number.
    async fn latest_seq(&self) -> SyncResult<u64> {
        Ok(self.download_ops(0, None, Some(1)).await?.latest_seq)
    }
}
