//! Chunk Planner
//!
//! Splits a file of a given size into dense, non-overlapping chunk spans using
//! a size-tiered chunk size. Pure functions only.

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

pub const MIB: u64 = 1024 * 1024;

const SMALL_FILE_LIMIT: u64 = 10 * MIB;
const MEDIUM_FILE_LIMIT: u64 = 100 * MIB;

const SMALL_CHUNK: u64 = MIB;
const MEDIUM_CHUNK: u64 = 5 * MIB;
const LARGE_CHUNK: u64 = 10 * MIB;

/// A contiguous byte range of a file, identified by its sequence index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Chunk size used for a file of `total_size` bytes.
pub fn chunk_size_for(total_size: u64) -> u64 {
    if total_size < SMALL_FILE_LIMIT {
        SMALL_CHUNK
    } else if total_size < MEDIUM_FILE_LIMIT {
        MEDIUM_CHUNK
    } else {
        LARGE_CHUNK
    }
}

pub fn chunk_count(total_size: u64) -> u32 {
    total_size.div_ceil(chunk_size_for(total_size)) as u32
}

/// The span of chunk `index`, or `None` past the end of the file.
pub fn chunk_span(total_size: u64, index: u32) -> Option<ChunkSpan> {
    let size = chunk_size_for(total_size);
    let offset = u64::from(index) * size;
    if offset >= total_size {
        return None;
    }
    Some(ChunkSpan {
        index,
        offset,
        length: size.min(total_size - offset),
    })
}

pub fn plan_chunks(total_size: u64) -> Vec<ChunkSpan> {
    (0..chunk_count(total_size))
        .filter_map(|index| chunk_span(total_size, index))
        .collect()
}

/// Checks that `plan` tiles `[0, total_size)` with dense indices.
///
/// Plans travel over the wire in download responses, so the destination
/// validates them before trusting offsets.
pub fn validate_plan(plan: &[ChunkSpan], total_size: u64) -> Result<()> {
    let mut expected_offset = 0u64;
    for (position, span) in plan.iter().enumerate() {
        if span.index as usize != position {
            return Err(ClusterError::Protocol(format!(
                "chunk plan index {} at position {}",
                span.index, position
            )));
        }
        if span.offset != expected_offset || span.length == 0 {
            return Err(ClusterError::Protocol(format!(
                "chunk {} covers [{}, {}) but {} was expected next",
                span.index,
                span.offset,
                span.end(),
                expected_offset
            )));
        }
        expected_offset = span.end();
    }
    if expected_offset != total_size {
        return Err(ClusterError::Protocol(format!(
            "chunk plan covers {} of {} bytes",
            expected_offset, total_size
        )));
    }
    Ok(())
}
