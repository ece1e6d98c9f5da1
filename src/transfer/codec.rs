//! Checksum and Framing Codec
//!
//! A chunk travels as one frame: a fixed-size header followed by the payload.
//!
//! ```text
//! +-------+---------+----------+--------+--------+-------------+---------+
//! | magic | version | sequence | offset | length | digest (32) | payload |
//! |  u32  |   u16   |   u32    |  u64   |  u32   |   [u8; 32]  |  bytes  |
//! +-------+---------+----------+--------+--------+-------------+---------+
//! ```
//!
//! The header is bincode-encoded (fixed-width integers), so it is always
//! [`FRAME_HEADER_LEN`] bytes. Decoding only checks structure; the digest is
//! verified by the requester against the span it asked for.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::planner::ChunkSpan;
use crate::error::{ClusterError, Result};

pub const DIGEST_LEN: usize = 32;
pub type Digest = [u8; DIGEST_LEN];

pub const FRAME_MAGIC: u32 = 0x5343_4B31;
pub const FRAME_VERSION: u16 = 1;
pub const FRAME_HEADER_LEN: usize = 4 + 2 + 4 + 8 + 4 + DIGEST_LEN;

/// SHA-256 over `bytes`.
pub fn digest(bytes: &[u8]) -> Digest {
    Sha256::digest(bytes).into()
}

pub fn digest_hex(digest: &Digest) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub sequence_index: u32,
    pub offset: u64,
    pub length: u32,
    pub digest: Digest,
}

impl FrameHeader {
    pub fn for_chunk(span: &ChunkSpan, payload: &[u8]) -> Result<Self> {
        if payload.len() as u64 != span.length {
            return Err(ClusterError::Protocol(format!(
                "chunk {} payload is {} bytes, span says {}",
                span.index,
                payload.len(),
                span.length
            )));
        }
        let length = u32::try_from(span.length).map_err(|_| {
            ClusterError::Protocol(format!("chunk {} too large to frame", span.index))
        })?;
        Ok(Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            sequence_index: span.index,
            offset: span.offset,
            length,
            digest: digest(payload),
        })
    }
}

pub fn encode_header(header: &FrameHeader) -> Result<Vec<u8>> {
    Ok(bincode::serialize(header)?)
}

pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(ClusterError::Protocol(format!(
            "frame header truncated: {} of {} bytes",
            bytes.len(),
            FRAME_HEADER_LEN
        )));
    }
    let header: FrameHeader = bincode::deserialize(&bytes[..FRAME_HEADER_LEN])?;
    if header.magic != FRAME_MAGIC {
        return Err(ClusterError::Protocol(format!(
            "bad frame magic {:#010x}",
            header.magic
        )));
    }
    if header.version != FRAME_VERSION {
        return Err(ClusterError::Protocol(format!(
            "unsupported frame version {}",
            header.version
        )));
    }
    Ok(header)
}

/// A decoded chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl ChunkFrame {
    pub fn new(span: &ChunkSpan, payload: Vec<u8>) -> Result<Self> {
        let header = FrameHeader::for_chunk(span, &payload)?;
        Ok(Self { header, payload })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = encode_header(&self.header)?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = decode_header(bytes)?;
        let payload = &bytes[FRAME_HEADER_LEN..];
        if payload.len() != header.length as usize {
            return Err(ClusterError::Protocol(format!(
                "frame {} carries {} payload bytes, header says {}",
                header.sequence_index,
                payload.len(),
                header.length
            )));
        }
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    /// Checks the frame answers the request for `expected` and is intact.
    pub fn verify(&self, expected: &ChunkSpan) -> Result<()> {
        let header = &self.header;
        if header.sequence_index != expected.index
            || header.offset != expected.offset
            || u64::from(header.length) != expected.length
        {
            return Err(ClusterError::Protocol(format!(
                "asked for chunk {} at {}+{}, got chunk {} at {}+{}",
                expected.index,
                expected.offset,
                expected.length,
                header.sequence_index,
                header.offset,
                header.length
            )));
        }
        if self.payload.len() as u64 != expected.length {
            return Err(ClusterError::Protocol(format!(
                "chunk {} payload truncated",
                expected.index
            )));
        }
        let actual = digest(&self.payload);
        if actual != header.digest {
            return Err(ClusterError::Protocol(format!(
                "chunk {} digest mismatch: expected {}, got {}",
                expected.index,
                digest_hex(&header.digest),
                digest_hex(&actual)
            )));
        }
        Ok(())
    }
}
