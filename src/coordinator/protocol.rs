//! Cluster Network Protocol
//!
//! Endpoints and message types for the control plane (peer ↔ coordinator) and
//! the data plane (peer ↔ peer, coordinator → peer).
//!
//! The control plane is a single endpoint carrying one tagged request enum;
//! the dispatcher answers every variant with a [`ControlResponse`]. Errors
//! travel as `ControlResponse::Error` with a typed [`ErrorKind`].

use serde::{Deserialize, Serialize};

use super::types::{PeerSummary, ReplicationState};
use crate::error::{ClusterError, ErrorKind, Result};
use crate::transfer::planner::ChunkSpan;
use crate::types::{FileId, PeerId};

// --- API Endpoints ---

/// Coordinator control-plane endpoint.
pub const ENDPOINT_CONTROL: &str = "/control";
/// Peer endpoint serving one encoded chunk frame.
pub const ENDPOINT_CHUNK: &str = "/internal/chunk";
/// Peer endpoint accepting a replica order from the coordinator.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// Peer endpoint creating a file locally (operator / collaborator facing).
pub const ENDPOINT_CREATE: &str = "/local/create";
/// Peer endpoint pulling a file from the cluster onto this peer.
pub const ENDPOINT_DOWNLOAD: &str = "/local/download";

pub const CONTENT_TYPE_FRAME: &str = "application/octet-stream";

// --- Control plane ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlRequest {
    Register {
        peer_id: PeerId,
        addr: String,
        cpu: u32,
        memory_gb: u32,
        storage_gb: u64,
        bandwidth_mbps: u64,
    },
    Heartbeat {
        peer_id: PeerId,
        used_storage_bytes: u64,
        /// Sender's wall clock, ms since epoch. Informational only.
        timestamp: u64,
    },
    NotifyFileCreated {
        file_id: FileId,
        name: String,
        size_bytes: u64,
        owner_peer_id: PeerId,
        replication_factor: u32,
    },
    ListFiles,
    RequestDownload {
        file_id: FileId,
        requester_peer_id: PeerId,
    },
    TransferComplete {
        file_id: FileId,
        peer_id: PeerId,
        success: bool,
    },
    ListPeers,
}

impl ControlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Register { .. } => "Register",
            ControlRequest::Heartbeat { .. } => "Heartbeat",
            ControlRequest::NotifyFileCreated { .. } => "NotifyFileCreated",
            ControlRequest::ListFiles => "ListFiles",
            ControlRequest::RequestDownload { .. } => "RequestDownload",
            ControlRequest::TransferComplete { .. } => "TransferComplete",
            ControlRequest::ListPeers => "ListPeers",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlResponse {
    Register {
        accepted: bool,
        reason: Option<String>,
    },
    Heartbeat {
        ack: bool,
    },
    NotifyFileCreated {
        accepted: bool,
    },
    Files {
        files: Vec<FileSummary>,
    },
    Download(DownloadPlan),
    Ack,
    Peers {
        peers: Vec<PeerSummary>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ControlResponse {
    /// Turns an `Error` response back into a typed error.
    pub fn into_result(self) -> Result<Self> {
        match self {
            ControlResponse::Error { kind, message } => Err(ClusterError::from_wire(kind, message)),
            other => Ok(other),
        }
    }
}

impl From<ClusterError> for ControlResponse {
    fn from(err: ClusterError) -> Self {
        ControlResponse::Error {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSummary {
    pub file_id: FileId,
    pub name: String,
    pub size_bytes: u64,
    pub owner_peer_id: PeerId,
    pub holders: Vec<PeerId>,
    pub replication_factor: u32,
    pub state: ReplicationState,
    pub created_at_ms: u64,
}

/// Where and how to fetch a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadPlan {
    pub file_id: FileId,
    pub name: String,
    pub source_peer_id: PeerId,
    pub source_addr: String,
    pub size_bytes: u64,
    pub chunk_plan: Vec<ChunkSpan>,
}

// --- Data plane ---

/// Coordinator → target peer: pull `file_id` from the source and keep it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicateOrder {
    pub file_id: FileId,
    pub name: String,
    pub size_bytes: u64,
    pub source_peer_id: PeerId,
    pub source_addr: String,
    pub chunk_plan: Vec<ChunkSpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicateResponse {
    pub bytes_written: u64,
    pub error: Option<WireError>,
}

impl ReplicateResponse {
    pub fn from_result(result: Result<u64>) -> Self {
        match result {
            Ok(bytes_written) => Self {
                bytes_written,
                error: None,
            },
            Err(e) => Self {
                bytes_written: 0,
                error: Some(e.into()),
            },
        }
    }

    pub fn into_result(self) -> Result<u64> {
        match self.error {
            None => Ok(self.bytes_written),
            Some(e) => Err(e.into()),
        }
    }
}

/// An error as carried inside data-plane responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<ClusterError> for WireError {
    fn from(err: ClusterError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

impl From<WireError> for ClusterError {
    fn from(err: WireError) -> Self {
        ClusterError::from_wire(err.kind, err.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchChunkRequest {
    pub file_id: FileId,
    pub sequence_index: u32,
}

// --- Peer local API ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateFileRequest {
    pub name: String,
    pub size_bytes: u64,
    pub replication_factor: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateFileResponse {
    pub file_id: Option<FileId>,
    /// False when the coordinator could not be told (local-only copy).
    pub registered: bool,
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRequest {
    pub file_id: FileId,
}
