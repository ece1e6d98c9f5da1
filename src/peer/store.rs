//! Peer-local file storage.
//!
//! Files live in memory. Capacity is enforced with an atomic reservation
//! counter: bytes are reserved before content exists and released if the
//! file never makes it into the store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ClusterError, Result};
use crate::transfer::codec::ChunkFrame;
use crate::transfer::planner::chunk_span;
use crate::transfer::session::{ChunkSink, ChunkSource};
use crate::types::FileId;

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: FileId,
    pub name: String,
    pub bytes: Arc<Vec<u8>>,
    pub created_at_ms: u64,
}

impl StoredFile {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Bytes held against the store's capacity. Released on drop unless
/// committed into a stored file.
#[derive(Debug)]
pub struct Reservation {
    used: Arc<AtomicU64>,
    bytes: u64,
    committed: bool,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.used.fetch_sub(self.bytes, Ordering::SeqCst);
        }
    }
}

pub struct LocalStore {
    capacity: u64,
    used: Arc<AtomicU64>,
    files: DashMap<FileId, StoredFile>,
}

impl LocalStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: Arc::new(AtomicU64::new(0)),
            files: DashMap::new(),
        }
    }

    /// Bytes stored or reserved.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    /// Atomically claims `bytes` of capacity.
    pub fn try_reserve(&self, bytes: u64) -> Result<Reservation> {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|next| *next <= self.capacity)
                .ok_or_else(|| {
                    ClusterError::Resource(format!(
                        "need {} bytes, {} of {} free",
                        bytes,
                        self.capacity.saturating_sub(current),
                        self.capacity
                    ))
                })?;
            match self
                .used
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return Ok(Reservation {
                        used: self.used.clone(),
                        bytes,
                        committed: false,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Stores `bytes` under `file_id`, consuming the reservation that paid
    /// for them. A file already present is kept and the reservation released.
    pub fn insert(&self, file: StoredFile, reservation: Reservation) -> Result<()> {
        if reservation.bytes() != file.size() {
            return Err(ClusterError::Protocol(format!(
                "file {} is {} bytes but {} were reserved",
                file.file_id,
                file.size(),
                reservation.bytes()
            )));
        }
        match self.files.entry(file.file_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!("File {} already stored", file.file_id);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(file);
                reservation.commit();
            }
        }
        Ok(())
    }

    pub fn get(&self, file_id: &FileId) -> Option<StoredFile> {
        self.files.get(file_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, file_id: &FileId) -> bool {
        self.files.contains_key(file_id)
    }

    /// Frames chunk `sequence_index` of a stored file.
    pub fn read_chunk(&self, file_id: &FileId, sequence_index: u32) -> Result<ChunkFrame> {
        let file = self
            .get(file_id)
            .ok_or_else(|| ClusterError::NotFound(format!("file {}", file_id)))?;
        let span = chunk_span(file.size(), sequence_index).ok_or_else(|| {
            ClusterError::NotFound(format!("chunk {} of file {}", sequence_index, file_id))
        })?;
        let payload = file.bytes[span.offset as usize..span.end() as usize].to_vec();
        ChunkFrame::new(&span, payload)
    }
}

#[async_trait]
impl ChunkSource for LocalStore {
    async fn fetch_chunk(&self, file_id: &FileId, sequence_index: u32) -> Result<ChunkFrame> {
        self.read_chunk(file_id, sequence_index)
    }
}

/// Destination buffer for an incoming transfer. Only committed to the store
/// once every chunk has landed.
pub struct StagedFile {
    buf: Mutex<Vec<u8>>,
}

impl StagedFile {
    pub fn new(size: u64) -> Self {
        Self {
            buf: Mutex::new(vec![0u8; size as usize]),
        }
    }

    /// Moves the staged bytes out, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock())
    }
}

impl ChunkSink for StagedFile {
    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut buf = self.buf.lock();
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                ClusterError::Protocol(format!(
                    "write of {} bytes at {} past end of {}-byte file",
                    bytes.len(),
                    offset,
                    buf.len()
                ))
            })?;
        buf[start..end].copy_from_slice(bytes);
        Ok(())
    }
}
