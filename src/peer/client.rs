//! HTTP clients for the control and data planes.
//!
//! [`PeerTransport`] is the seam between a peer agent and the network: the
//! agent only ever talks to the coordinator and to other peers through it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::protocol::{
    ControlRequest, ControlResponse, ENDPOINT_CHUNK, ENDPOINT_CONTROL, ENDPOINT_REPLICATE,
    FetchChunkRequest, ReplicateOrder, ReplicateResponse,
};
use crate::coordinator::replication::ReplicaLauncher;
use crate::coordinator::types::PeerSummary;
use crate::error::{ClusterError, Result};
use crate::transfer::codec::ChunkFrame;
use crate::transfer::session::ChunkSource;
use crate::types::{FileId, PeerId};

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Sends one control-plane request. `Error` responses come back as `Err`.
    async fn control(&self, request: ControlRequest) -> Result<ControlResponse>;

    /// A chunk source reading from `peer_id` at `addr`.
    fn chunk_source(&self, peer_id: &PeerId, addr: &str) -> Arc<dyn ChunkSource>;
}

fn base_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr.trim_end_matches('/'))
    }
}

/// Decodes a JSON error body, falling back to the status line.
async fn error_from_response(response: reqwest::Response) -> ClusterError {
    let status = response.status();
    match response.json::<ControlResponse>().await {
        Ok(ControlResponse::Error { kind, message }) => ClusterError::from_wire(kind, message),
        _ => ClusterError::Connection(format!("peer answered {}", status)),
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    coordinator_url: String,
    chunk_timeout: Duration,
}

impl HttpTransport {
    pub fn new(coordinator_addr: &str, chunk_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            coordinator_url: base_url(coordinator_addr),
            chunk_timeout,
        }
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn control(&self, request: ControlRequest) -> Result<ControlResponse> {
        let url = format!("{}{}", self.coordinator_url, ENDPOINT_CONTROL);
        let response = self.client.post(url).json(&request).send().await?;
        // Error responses carry a JSON body regardless of status.
        let body: ControlResponse = response.json().await?;
        body.into_result()
    }

    fn chunk_source(&self, peer_id: &PeerId, addr: &str) -> Arc<dyn ChunkSource> {
        Arc::new(HttpChunkSource {
            client: self.client.clone(),
            peer_id: peer_id.clone(),
            url: format!("{}{}", base_url(addr), ENDPOINT_CHUNK),
            timeout: self.chunk_timeout,
        })
    }
}

pub struct HttpChunkSource {
    client: reqwest::Client,
    peer_id: PeerId,
    url: String,
    timeout: Duration,
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn fetch_chunk(&self, file_id: &FileId, sequence_index: u32) -> Result<ChunkFrame> {
        let request = FetchChunkRequest {
            file_id: file_id.clone(),
            sequence_index,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = error_from_response(response).await;
            tracing::debug!("Chunk {} of {} from {} refused: {}", sequence_index, file_id, self.peer_id, err);
            return Err(err);
        }

        let bytes = response.bytes().await?;
        ChunkFrame::decode(&bytes)
    }
}

/// Delivers replica orders to target peers over HTTP.
pub struct HttpReplicaLauncher {
    client: reqwest::Client,
}

impl HttpReplicaLauncher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpReplicaLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicaLauncher for HttpReplicaLauncher {
    async fn replicate(&self, target: &PeerSummary, order: ReplicateOrder) -> Result<()> {
        let url = format!("{}{}", base_url(&target.addr), ENDPOINT_REPLICATE);
        let response = self.client.post(url).json(&order).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: ReplicateResponse = response.json().await?;
        let bytes = body.into_result()?;
        tracing::debug!("Peer {} stored {} bytes of {}", target.peer_id, bytes, order.file_id);
        Ok(())
    }
}
