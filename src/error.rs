//! Error taxonomy shared by the coordinator and the peers.
//!
//! Every fallible core operation returns [`ClusterError`]. The variants map
//! one-to-one onto the way a failure is handled:
//!
//! - `Connection`: transport timeout or refusal. Retried with backoff at the
//!   boundary, never fatal to the process.
//! - `Protocol`: checksum mismatch, malformed frame or malformed request.
//!   Retried per chunk up to a bound, then fails the transfer session.
//! - `Resource`: not enough storage or bandwidth on a peer.
//! - `NotFound`: unknown peer-id or file-id, surfaced to the immediate caller.
//! - `Conflict`: duplicate or incompatible registration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Wire form of an error kind, carried in control-plane error responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Resource,
    NotFound,
    Conflict,
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Connection(_) => ErrorKind::Connection,
            ClusterError::Protocol(_) => ErrorKind::Protocol,
            ClusterError::Resource(_) => ErrorKind::Resource,
            ClusterError::NotFound(_) => ErrorKind::NotFound,
            ClusterError::Conflict(_) => ErrorKind::Conflict,
        }
    }

    /// Rebuilds an error received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Connection => ClusterError::Connection(message),
            ErrorKind::Protocol => ClusterError::Protocol(message),
            ErrorKind::Resource => ClusterError::Resource(message),
            ErrorKind::NotFound => ClusterError::NotFound(message),
            ErrorKind::Conflict => ClusterError::Conflict(message),
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Connection(_) | ClusterError::Protocol(_))
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            ClusterError::Connection(m)
            | ClusterError::Protocol(m)
            | ClusterError::Resource(m)
            | ClusterError::NotFound(m)
            | ClusterError::Conflict(m) => m,
        }
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClusterError::Protocol(err.to_string())
        } else {
            ClusterError::Connection(err.to_string())
        }
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Protocol(format!("frame encoding: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Connection("request timed out".to_string())
    }
}
