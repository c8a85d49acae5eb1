//! HTTP client for servers that store an operation log natively.
//!
//! Routes:
//! - `POST /api/sync/ops` with [`UploadOpsRequest`]
//! - `GET /api/sync/ops?sinceSeq=&limit=&excludeClient=`
//! - `POST /api/sync/snapshot` with [`SnapshotUpload`]

use super::OperationSyncCapable;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    DownloadOpsResponse, SnapshotUpload, SnapshotUploadResponse, UploadOpsRequest,
    UploadOpsResponse,
};
use async_trait::async_trait;
use opsync_store::Operation;
use opsync_types::ClientId;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpEndpointConfig {
    /// Server base URL, without a trailing slash.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub access_token: Option<String>,
    /// Client-side request timeout (in seconds).
    pub timeout_secs: u64,
}

impl Default for HttpEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            access_token: None,
            timeout_secs: 30,
        }
    }
}

/// [`OperationSyncCapable`] over HTTP.
pub struct HttpSyncEndpoint {
    config: HttpEndpointConfig,
    client: Client,
}

impl HttpSyncEndpoint {
    /// Creates a new endpoint client.
    pub fn new(config: HttpEndpointConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> SyncResult<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| map_transport_error(e, what))?;
        let response = check_status(response, what).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("failed to parse {what} response: {e}")))
    }
}

fn map_transport_error(e: reqwest::Error, what: &str) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Network(format!("{what} failed: {e}"))
    }
}

async fn check_status(response: Response, what: &str) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("{} returned {}: {}", what, status, body);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::Auth(format!("{what} returned {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited(body),
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            SyncError::QuotaExceeded(body)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SyncError::Timeout,
        _ => SyncError::Network(format!("{what} returned {status}: {body}")),
    })
}

#[async_trait]
impl OperationSyncCapable for HttpSyncEndpoint {
    fn provider_name(&self) -> &'static str {
        "HTTP"
    }

    async fn upload_ops(
        &self,
        ops: &[Operation],
        client_id: &ClientId,
        last_known_server_seq: u64,
    ) -> SyncResult<UploadOpsResponse> {
        debug!("Uploading {} ops to {}", ops.len(), self.config.base_url);
        let body = UploadOpsRequest {
            ops: ops.to_vec(),
            client_id: client_id.clone(),
            last_known_server_seq,
        };
        self.send(self.client.post(self.url("/api/sync/ops")).json(&body), "upload")
            .await
    }

    async fn download_ops(
        &self,
        since_seq: u64,
        exclude_client: Option<&ClientId>,
        limit: Option<usize>,
    ) -> SyncResult<DownloadOpsResponse> {
        let mut query = vec![("sinceSeq", since_seq.to_string())];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(client) = exclude_client {
            query.push(("excludeClient", client.to_string()));
        }
        self.send(
            self.client.get(self.url("/api/sync/ops")).query(&query),
            "download",
        )
        .await
    }

    async fn upload_snapshot(
        &self,
        snapshot: &SnapshotUpload,
    ) -> SyncResult<SnapshotUploadResponse> {
        debug!(
            "Uploading snapshot {} (clean slate: {})",
            snapshot.op_id, snapshot.is_clean_slate
        );
        self.send(
            self.client.post(self.url("/api/sync/snapshot")).json(snapshot),
            "snapshot upload",
        )
        .await
    }
}
