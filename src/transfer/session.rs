//! Transfer Session
//!
//! Pulls every chunk of one file from a source peer into a sink on the
//! destination. Chunks are fetched sequentially or by a small pool of workers
//! and written at their fixed offsets, so completion order never changes the
//! result.
//!
//! ## Failure handling
//! A chunk that times out, fails to connect or fails verification is retried
//! up to `max_chunk_attempts`. When the bound is hit the session stops handing
//! out new chunks and fails with the last error. Chunks already written stay in
//! the sink; discarding them is the caller's decision.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::codec::ChunkFrame;
use super::planner::{ChunkSpan, MIB, validate_plan};
use super::progress::{ProgressTracker, TransferProgress};
use crate::config::TransferConfig;
use crate::error::{ClusterError, Result};
use crate::types::{FileId, PeerId, TransferId};

/// Largest single write handed to a sink.
pub const MAX_WRITE_SPAN: usize = MIB as usize;

/// Minimum plan length before parallel fetch is considered.
const PARALLEL_MIN_CHUNKS: usize = 4;
const PARALLEL_MIN_SLOTS: usize = 2;

/// Where chunk frames come from. Implemented over HTTP between peers and
/// directly by the local store.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_chunk(&self, file_id: &FileId, sequence_index: u32) -> Result<ChunkFrame>;
}

/// Positional writer for the destination's staged copy.
pub trait ChunkSink: Send + Sync {
    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Sequential,
    Parallel(usize),
}

/// Parallel only pays off with enough chunks and at least two free slots.
pub fn fetch_mode(chunk_count: usize, available_slots: usize, max_workers: usize) -> FetchMode {
    if chunk_count >= PARALLEL_MIN_CHUNKS && available_slots >= PARALLEL_MIN_SLOTS {
        let workers = available_slots.min(max_workers).min(chunk_count);
        if workers >= PARALLEL_MIN_SLOTS {
            return FetchMode::Parallel(workers);
        }
    }
    FetchMode::Sequential
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub transfer_id: TransferId,
    pub file_id: FileId,
    pub bytes_written: u64,
    pub chunks: usize,
    pub mode: FetchMode,
    pub elapsed: Duration,
}

pub struct TransferSession {
    transfer_id: TransferId,
    file_id: FileId,
    source_peer: PeerId,
    destination_peer: PeerId,
    total_size: u64,
    chunks: Vec<ChunkSpan>,
    status: Mutex<Vec<ChunkStatus>>,
    progress: ProgressTracker,
    config: TransferConfig,
    reporter: Option<mpsc::UnboundedSender<TransferProgress>>,
    next: AtomicUsize,
    aborted: AtomicBool,
}

impl TransferSession {
    /// Builds a session over `chunks`, which must tile `[0, total_size)`.
    pub fn new(
        file_id: FileId,
        source_peer: PeerId,
        destination_peer: PeerId,
        total_size: u64,
        chunks: Vec<ChunkSpan>,
        config: TransferConfig,
    ) -> Result<Self> {
        validate_plan(&chunks, total_size)?;
        let transfer_id = TransferId::generate();
        let progress = ProgressTracker::new(
            transfer_id.clone(),
            file_id.clone(),
            total_size,
            config.progress_step_percent,
        );
        Ok(Self {
            status: Mutex::new(vec![ChunkStatus::Pending; chunks.len()]),
            transfer_id,
            file_id,
            source_peer,
            destination_peer,
            total_size,
            chunks,
            progress,
            config,
            reporter: None,
            next: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        })
    }

    pub fn with_reporter(mut self, reporter: mpsc::UnboundedSender<TransferProgress>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn statuses(&self) -> Vec<ChunkStatus> {
        self.status.lock().clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.progress.bytes_written()
    }

    /// Runs the session to completion or first unrecoverable chunk failure.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn ChunkSource>,
        sink: Arc<dyn ChunkSink>,
        available_slots: usize,
    ) -> Result<TransferReport> {
        let mode = fetch_mode(self.chunks.len(), available_slots, self.config.max_workers);
        tracing::info!(
            "Transfer {} of file {} from {} to {}: {} bytes in {} chunks ({:?})",
            self.transfer_id,
            self.file_id,
            self.source_peer,
            self.destination_peer,
            self.total_size,
            self.chunks.len(),
            mode
        );

        match mode {
            FetchMode::Sequential => {
                self.worker_loop(0, source.as_ref(), sink.as_ref()).await?;
            }
            FetchMode::Parallel(workers) => {
                let mut set = JoinSet::new();
                for worker_id in 0..workers {
                    let session = self.clone();
                    let source = source.clone();
                    let sink = sink.clone();
                    set.spawn(async move {
                        session
                            .worker_loop(worker_id, source.as_ref(), sink.as_ref())
                            .await
                    });
                }

                let mut first_error = None;
                while let Some(joined) = set.join_next().await {
                    let outcome = joined.unwrap_or_else(|e| {
                        Err(ClusterError::Connection(format!("transfer worker died: {}", e)))
                    });
                    if let Err(e) = outcome {
                        self.aborted.store(true, Ordering::SeqCst);
                        first_error.get_or_insert(e);
                    }
                }
                if let Some(e) = first_error {
                    return Err(e);
                }
            }
        }

        // Zero-length files still report completion once.
        if self.total_size == 0 {
            self.publish(self.progress.record(0));
        }

        let report = TransferReport {
            transfer_id: self.transfer_id.clone(),
            file_id: self.file_id.clone(),
            bytes_written: self.progress.bytes_written(),
            chunks: self.chunks.len(),
            mode,
            elapsed: self.progress.elapsed(),
        };
        tracing::info!(
            "Transfer {} complete: {} bytes in {:?}",
            report.transfer_id,
            report.bytes_written,
            report.elapsed
        );
        Ok(report)
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        source: &dyn ChunkSource,
        sink: &dyn ChunkSink,
    ) -> Result<()> {
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                tracing::debug!("Transfer {} worker {} stopping", self.transfer_id, worker_id);
                return Ok(());
            }

            let position = self.next.fetch_add(1, Ordering::SeqCst);
            let Some(span) = self.chunks.get(position).copied() else {
                return Ok(());
            };

            self.set_status(position, ChunkStatus::InFlight);
            match self.fetch_chunk_with_retry(source, sink, &span).await {
                Ok(()) => {
                    self.set_status(position, ChunkStatus::Done);
                    self.publish(self.progress.record(span.length));
                }
                Err(e) => {
                    self.set_status(position, ChunkStatus::Failed);
                    self.aborted.store(true, Ordering::SeqCst);
                    tracing::error!(
                        "Transfer {} chunk {} failed for good: {}",
                        self.transfer_id,
                        span.index,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_chunk_with_retry(
        &self,
        source: &dyn ChunkSource,
        sink: &dyn ChunkSink,
        span: &ChunkSpan,
    ) -> Result<()> {
        let max_attempts = self.config.max_chunk_attempts.max(1);
        let mut last_error = ClusterError::Connection(format!("chunk {} never attempted", span.index));

        for attempt in 1..=max_attempts {
            let fetched =
                tokio::time::timeout(self.config.chunk_timeout, source.fetch_chunk(&self.file_id, span.index))
                    .await
                    .map_err(ClusterError::from)
                    .and_then(|frame| frame)
                    .and_then(|frame| frame.verify(span).map(|_| frame));

            match fetched {
                Ok(frame) => return write_spans(sink, span.offset, &frame.payload),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Transfer {} chunk {} attempt {}/{} failed: {}",
                        self.transfer_id,
                        span.index,
                        attempt,
                        max_attempts,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(last_error)
    }

    fn set_status(&self, position: usize, status: ChunkStatus) {
        if let Some(slot) = self.status.lock().get_mut(position) {
            *slot = status;
        }
    }

    fn publish(&self, progress: Option<TransferProgress>) {
        let (Some(progress), Some(reporter)) = (progress, &self.reporter) else {
            return;
        };
        tracing::debug!(
            "Transfer {}: {}% ({:.0} B/s)",
            progress.transfer_id,
            progress.percent,
            progress.rate_bytes_per_sec
        );
        // Observers may have gone away; the transfer carries on regardless.
        let _ = reporter.send(progress);
    }
}

/// Writes `payload` at `offset` in pieces of at most [`MAX_WRITE_SPAN`].
fn write_spans(sink: &dyn ChunkSink, offset: u64, payload: &[u8]) -> Result<()> {
    let mut cursor = offset;
    for piece in payload.chunks(MAX_WRITE_SPAN) {
        sink.write_at(cursor, piece)?;
        cursor += piece.len() as u64;
    }
    Ok(())
}
