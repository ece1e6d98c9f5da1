use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{NEUTRAL_PERFORMANCE, PERFORMANCE_REFERENCE_BPS, PERFORMANCE_SUCCESS_SHARE};
use crate::error::{ClusterError, Result};
use crate::types::{FileId, PeerId};

pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;
pub const BITS_PER_MBIT: u64 = 1_000_000;

/// Hardware a peer declares at registration. Immutable afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub cpu_units: u32,
    pub memory_gb: u32,
    pub storage_bytes: u64,
    /// Bits per second.
    pub bandwidth_bps: u64,
}

impl Capabilities {
    /// Builds capabilities from the operator-facing units used on the wire.
    pub fn from_units(cpu: u32, memory_gb: u32, storage_gb: u64, bandwidth_mbps: u64) -> Self {
        Self {
            cpu_units: cpu,
            memory_gb,
            storage_bytes: storage_gb.saturating_mul(BYTES_PER_GB),
            bandwidth_bps: bandwidth_mbps.saturating_mul(BITS_PER_MBIT),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpu_units == 0
            || self.memory_gb == 0
            || self.storage_bytes == 0
            || self.bandwidth_bps == 0
        {
            return Err(ClusterError::Conflict(format!(
                "capabilities must all be positive: {:?}",
                self
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Suspected,
    Offline,
}

/// The registry's view of one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Data-plane address (`host:port`).
    pub addr: String,
    pub capabilities: Capabilities,
    pub used_storage: u64,
    pub last_heartbeat: Instant,
    pub status: PeerStatus,
    pub active_transfers: u32,
    pub stats: TransferStats,
}

impl PeerRecord {
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            addr: self.addr.clone(),
            status: self.status,
            capabilities: self.capabilities,
            used_storage: self.used_storage,
            active_transfers: self.active_transfers,
            stats: self.stats,
            silent_for_ms: self.last_heartbeat.elapsed().as_millis() as u64,
        }
    }
}

/// Serializable copy of a [`PeerRecord`], used for placement and `ListPeers`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub addr: String,
    pub status: PeerStatus,
    pub capabilities: Capabilities,
    pub used_storage: u64,
    pub active_transfers: u32,
    #[serde(default)]
    pub stats: TransferStats,
    pub silent_for_ms: u64,
}

impl PeerSummary {
    pub fn free_storage(&self) -> u64 {
        self.capabilities.storage_bytes.saturating_sub(self.used_storage)
    }

    pub fn is_online(&self) -> bool {
        self.status == PeerStatus::Online
    }

    /// Not yet declared OFFLINE. SUSPECTED peers still count as holders.
    pub fn is_present(&self) -> bool {
        self.status != PeerStatus::Offline
    }
}

/// Outcome history of the transfers a peer was chosen for.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferStats {
    pub completed: u64,
    pub failed: u64,
    /// Bytes moved by completed transfers.
    pub bytes: u64,
    /// Wall time spent in completed transfers.
    pub busy_ms: u64,
}

impl TransferStats {
    pub fn record(&mut self, bytes: u64, elapsed: Duration, success: bool) {
        if success {
            self.completed += 1;
            self.bytes = self.bytes.saturating_add(bytes);
            self.busy_ms = self.busy_ms.saturating_add(elapsed.as_millis() as u64);
        } else {
            self.failed += 1;
        }
    }

    pub fn attempts(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn success_rate(&self) -> Option<f64> {
        match self.attempts() {
            0 => None,
            n => Some(self.completed as f64 / n as f64),
        }
    }

    /// Average bits per second over completed transfers; zero while no time
    /// has been measured.
    pub fn throughput_bps(&self) -> f64 {
        if self.busy_ms == 0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / (self.busy_ms as f64 / 1000.0)
    }

    /// Blend of success rate and throughput in [0, 1]. Peers without history
    /// get a neutral score.
    pub fn performance_score(&self) -> f64 {
        let Some(success_rate) = self.success_rate() else {
            return NEUTRAL_PERFORMANCE;
        };
        let speed = (self.throughput_bps() / PERFORMANCE_REFERENCE_BPS).min(1.0);
        success_rate * PERFORMANCE_SUCCESS_SHARE + speed * (1.0 - PERFORMANCE_SUCCESS_SHARE)
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this peer-id is seen.
    Registered,
    /// Known peer registering again while ONLINE or SUSPECTED.
    Reregistered,
    /// Known peer coming back from OFFLINE.
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Alive,
    /// The peer was SUSPECTED and is ONLINE again.
    Refuted,
    /// The peer was OFFLINE; the heartbeat counts as re-registration.
    Recovered,
}

/// Status transitions published by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEvent {
    Registered(PeerId),
    Suspected(PeerId),
    Offline(PeerId),
    Recovered(PeerId),
}

impl PeerEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            PeerEvent::Registered(id)
            | PeerEvent::Suspected(id)
            | PeerEvent::Offline(id)
            | PeerEvent::Recovered(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicationState {
    Creating,
    Replicating,
    Satisfied,
    UnderReplicated,
}

/// The coordinator's record of one file and where its replicas live.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: FileId,
    pub name: String,
    pub size_bytes: u64,
    pub owner: PeerId,
    pub replication_factor: u32,
    /// Always contains `owner`.
    pub holders: BTreeSet<PeerId>,
    /// Targets with a replica order in flight.
    pub pending: BTreeSet<PeerId>,
    pub created_at_ms: u64,
    pub state: ReplicationState,
}

impl FileRecord {
    pub fn new(
        file_id: FileId,
        name: String,
        size_bytes: u64,
        owner: PeerId,
        replication_factor: u32,
        created_at_ms: u64,
    ) -> Self {
        Self {
            holders: BTreeSet::from([owner.clone()]),
            pending: BTreeSet::new(),
            file_id,
            name,
            size_bytes,
            owner,
            replication_factor,
            created_at_ms,
            state: ReplicationState::Creating,
        }
    }

    /// Peers placement must skip: current holders and in-flight targets.
    pub fn excluded(&self) -> BTreeSet<PeerId> {
        self.holders.union(&self.pending).cloned().collect()
    }
}
