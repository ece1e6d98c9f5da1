//! Cluster Configuration
//!
//! Tunables for the coordinator, the peers and the transfer protocol. Defaults
//! are the named constants below; every struct can be overridden from
//! `CLUSTER_*` environment variables via `from_env()`.

use std::time::Duration;

// --- Failure detection ---

/// Silence after which an ONLINE peer becomes SUSPECTED.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
/// Extra silence after the timeout before a SUSPECTED peer becomes OFFLINE.
pub const OFFLINE_GRACE: Duration = Duration::from_secs(15);
/// Period of the failure-detector sweep and repair cycle.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Period of the heartbeat emitter on each peer.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// --- Placement ---

pub const WEIGHT_STORAGE: f64 = 0.5;
pub const WEIGHT_BANDWIDTH: f64 = 0.3;
pub const WEIGHT_CPU: f64 = 0.2;
/// Share of the score taken from transfer history. Zero keeps placement on
/// hardware and load alone.
pub const WEIGHT_PERFORMANCE: f64 = 0.0;
/// Concurrent transfers a peer is expected to sustain; scales bandwidth headroom.
pub const TRANSFER_SLOTS_PER_PEER: u32 = 4;
/// Peers with this many transfers in flight are not chosen as target or source.
pub const MAX_CONCURRENT_TRANSFERS_PER_PEER: u32 = 3;

// --- Transfer history ---

/// Performance score of a peer with no recorded transfers.
pub const NEUTRAL_PERFORMANCE: f64 = 0.5;
/// Part of the performance score taken from the success rate; the rest is throughput.
pub const PERFORMANCE_SUCCESS_SHARE: f64 = 0.7;
/// Throughput that earns the full speed share (1 Gbit/s).
pub const PERFORMANCE_REFERENCE_BPS: f64 = 1_000_000_000.0;

// --- Replication ---

pub const DEFAULT_REPLICATION_FACTOR: u32 = 2;
/// Upper bound on how long the coordinator waits for one replica order.
pub const REPLICA_ORDER_TIMEOUT: Duration = Duration::from_secs(600);

// --- Transfer ---

pub const MAX_CHUNK_ATTEMPTS: u32 = 3;
pub const CHUNK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const CHUNK_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const MAX_PARALLEL_WORKERS: usize = 4;
/// Progress is reported every time this many percent are crossed.
pub const PROGRESS_STEP_PERCENT: u64 = 10;

// --- Notify retry ---

pub const NOTIFY_MAX_ATTEMPTS: u32 = 7;
pub const NOTIFY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const NOTIFY_MAX_DELAY: Duration = Duration::from_secs(32);
pub const NOTIFY_BASE_TIMEOUT: Duration = Duration::from_secs(2);
pub const NOTIFY_MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// Files at least this large are generated off the agent's control path.
pub const BACKGROUND_CREATE_THRESHOLD: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_timeout: Duration,
    pub offline_grace: Duration,
    pub sweep_interval: Duration,
    pub placement: PlacementWeights,
    pub transfer_slots_per_peer: u32,
    pub max_concurrent_transfers: u32,
    pub replica_order_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            offline_grace: OFFLINE_GRACE,
            sweep_interval: SWEEP_INTERVAL,
            placement: PlacementWeights::default(),
            transfer_slots_per_peer: TRANSFER_SLOTS_PER_PEER,
            max_concurrent_transfers: MAX_CONCURRENT_TRANSFERS_PER_PEER,
            replica_order_timeout: REPLICA_ORDER_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_timeout: env_secs("CLUSTER_HEARTBEAT_TIMEOUT_SECS")
                .unwrap_or(defaults.heartbeat_timeout),
            offline_grace: env_secs("CLUSTER_OFFLINE_GRACE_SECS").unwrap_or(defaults.offline_grace),
            sweep_interval: env_secs("CLUSTER_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
            placement: env_f64("CLUSTER_PERFORMANCE_WEIGHT")
                .map(|share| defaults.placement.with_performance(share))
                .unwrap_or(defaults.placement),
            max_concurrent_transfers: env_u64("CLUSTER_MAX_CONCURRENT_TRANSFERS")
                .map(|n| n.max(1) as u32)
                .unwrap_or(defaults.max_concurrent_transfers),
            ..defaults
        }
    }
}

/// Weights of the placement score. They must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementWeights {
    pub storage: f64,
    pub bandwidth: f64,
    pub cpu: f64,
    pub performance: f64,
}

impl Default for PlacementWeights {
    fn default() -> Self {
        Self {
            storage: WEIGHT_STORAGE,
            bandwidth: WEIGHT_BANDWIDTH,
            cpu: WEIGHT_CPU,
            performance: WEIGHT_PERFORMANCE,
        }
    }
}

impl PlacementWeights {
    pub fn is_normalized(&self) -> bool {
        ((self.storage + self.bandwidth + self.cpu + self.performance) - 1.0).abs() < 1e-9
    }

    /// Gives `share` of the score to transfer history, scaling the hardware
    /// weights down so the total stays 1.
    pub fn with_performance(self, share: f64) -> Self {
        let share = share.clamp(0.0, 1.0);
        let hardware = self.storage + self.bandwidth + self.cpu;
        let scale = if hardware > 0.0 { (1.0 - share) / hardware } else { 0.0 };
        Self {
            storage: self.storage * scale,
            bandwidth: self.bandwidth * scale,
            cpu: self.cpu * scale,
            performance: share,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_chunk_attempts: u32,
    pub chunk_timeout: Duration,
    pub retry_delay: Duration,
    pub max_workers: usize,
    pub progress_step_percent: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_attempts: MAX_CHUNK_ATTEMPTS,
            chunk_timeout: CHUNK_REQUEST_TIMEOUT,
            retry_delay: CHUNK_RETRY_DELAY,
            max_workers: MAX_PARALLEL_WORKERS,
            progress_step_percent: PROGRESS_STEP_PERCENT,
        }
    }
}

/// Bounded exponential backoff used by the notify loop.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: NOTIFY_MAX_ATTEMPTS,
            base_delay: NOTIFY_BASE_DELAY,
            max_delay: NOTIFY_MAX_DELAY,
            base_timeout: NOTIFY_BASE_TIMEOUT,
            max_timeout: NOTIFY_MAX_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub heartbeat_interval: Duration,
    pub notify: BackoffConfig,
    pub transfer: TransferConfig,
    pub background_create_threshold: u64,
    pub control_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            notify: BackoffConfig::default(),
            transfer: TransferConfig::default(),
            background_create_threshold: BACKGROUND_CREATE_THRESHOLD,
            control_timeout: Duration::from_secs(10),
        }
    }
}

impl PeerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut transfer = defaults.transfer.clone();
        if let Some(attempts) = env_u64("CLUSTER_MAX_CHUNK_ATTEMPTS") {
            transfer.max_chunk_attempts = attempts.max(1) as u32;
        }
        if let Some(timeout) = env_secs("CLUSTER_CHUNK_TIMEOUT_SECS") {
            transfer.chunk_timeout = timeout;
        }
        Self {
            heartbeat_interval: env_secs("CLUSTER_HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            transfer,
            ..defaults
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

fn env_f64(name: &str) -> Option<f64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        Ok(_) => {
            tracing::warn!("Ignoring {}={:?}: not finite", name, raw);
            None
        }
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env_u64(name).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!(PlacementWeights::default().is_normalized());
    }

    #[test]
    fn test_performance_share_keeps_weights_normalized() {
        let weights = PlacementWeights::default().with_performance(0.2);

        assert!(weights.is_normalized());
        assert!((weights.performance - 0.2).abs() < 1e-9);
        assert!((weights.storage - 0.4).abs() < 1e-9);
        assert!((weights.cpu - 0.16).abs() < 1e-9);
    }

    #[test]
    fn test_offline_deadline_exceeds_timeout() {
        let config = CoordinatorConfig::default();
        assert!(config.heartbeat_timeout + config.offline_grace > config.heartbeat_timeout);
        assert!(config.sweep_interval < config.heartbeat_timeout);
    }
}
