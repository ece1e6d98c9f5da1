//! Progress accounting for a transfer session.
//!
//! Tracks bytes written, derives rate and ETA, and decides when a new report is
//! due (every `step_percent` crossed, plus once at completion).

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{FileId, TransferId};

/// A snapshot emitted to progress observers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub file_id: FileId,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub percent: u64,
    pub rate_bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Rate and remaining-time estimate. `None` ETA while no rate is known.
pub fn estimate(total: u64, written: u64, elapsed: Duration) -> (f64, Option<Duration>) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || written == 0 {
        return (0.0, None);
    }
    let rate = written as f64 / secs;
    let remaining = total.saturating_sub(written) as f64;
    (rate, Some(Duration::from_secs_f64(remaining / rate)))
}

struct ProgressState {
    bytes_written: u64,
    last_reported_percent: Option<u64>,
}

pub struct ProgressTracker {
    transfer_id: TransferId,
    file_id: FileId,
    total_bytes: u64,
    step_percent: u64,
    started: Instant,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(transfer_id: TransferId, file_id: FileId, total_bytes: u64, step_percent: u64) -> Self {
        Self {
            transfer_id,
            file_id,
            total_bytes,
            step_percent: step_percent.max(1),
            started: Instant::now(),
            state: Mutex::new(ProgressState {
                bytes_written: 0,
                last_reported_percent: None,
            }),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records `bytes` more written. Returns a snapshot when a report is due.
    pub fn record(&self, bytes: u64) -> Option<TransferProgress> {
        let mut state = self.state.lock();
        state.bytes_written = (state.bytes_written + bytes).min(self.total_bytes);
        let percent = self.percent_of(state.bytes_written);

        let due = match state.last_reported_percent {
            None => percent >= self.step_percent || percent == 100,
            Some(last) => percent >= last + self.step_percent || (percent == 100 && last < 100),
        };
        if !due {
            return None;
        }
        state.last_reported_percent = Some(percent);
        Some(self.report(state.bytes_written, percent))
    }

    fn percent_of(&self, written: u64) -> u64 {
        if self.total_bytes == 0 {
            100
        } else {
            written * 100 / self.total_bytes
        }
    }

    fn report(&self, written: u64, percent: u64) -> TransferProgress {
        let (rate, eta) = estimate(self.total_bytes, written, self.started.elapsed());
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            file_id: self.file_id.clone(),
            bytes_written: written,
            total_bytes: self.total_bytes,
            percent,
            rate_bytes_per_sec: rate,
            eta,
        }
    }
}
