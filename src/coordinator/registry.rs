//! Node Registry and Failure Detector
//!
//! Holds one [`PeerRecord`] per peer-id behind a single `RwLock`. Liveness is
//! driven by two inputs: heartbeats (push) and `sweep` (periodic). `now` is
//! always passed in, so the detector is a pure function of its inputs and the
//! clock.
//!
//! ```text
//!  ONLINE --(silent > timeout)--> SUSPECTED --(silent > timeout + grace)--> OFFLINE
//!     ^                              |                                        |
//!     +--------- heartbeat ----------+                                        |
//!     +-------------------- heartbeat / register (RECOVERED) -----------------+
//! ```
//!
//! Records are never removed.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use super::types::{
    Capabilities, HeartbeatOutcome, PeerEvent, PeerRecord, PeerStatus, PeerSummary, Registration,
    TransferStats,
};
use crate::config::CoordinatorConfig;
use crate::error::{ClusterError, Result};
use crate::types::PeerId;

pub struct NodeRegistry {
    heartbeat_timeout: Duration,
    offline_grace: Duration,
    peers: RwLock<BTreeMap<PeerId, PeerRecord>>,
}

impl NodeRegistry {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            offline_grace: config.offline_grace,
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds a peer or refreshes a known one.
    ///
    /// Capabilities are fixed at first registration; a later registration
    /// with different capabilities is a conflict. The address may change.
    pub fn register(
        &self,
        peer_id: PeerId,
        capabilities: Capabilities,
        addr: String,
        now: Instant,
    ) -> Result<Registration> {
        if peer_id.as_str().trim().is_empty() {
            return Err(ClusterError::Conflict("peer id must not be empty".to_string()));
        }
        capabilities.validate()?;

        let mut peers = self.peers.write();
        match peers.get_mut(&peer_id) {
            Some(existing) => {
                if existing.capabilities != capabilities {
                    return Err(ClusterError::Conflict(format!(
                        "peer {} already registered with {:?}",
                        peer_id, existing.capabilities
                    )));
                }
                let previous = existing.status;
                existing.addr = addr;
                existing.last_heartbeat = now;
                existing.status = PeerStatus::Online;

                if previous == PeerStatus::Offline {
                    tracing::info!("Peer {} re-registered after being offline", peer_id);
                    Ok(Registration::Recovered)
                } else {
                    tracing::info!("Peer {} re-registered", peer_id);
                    Ok(Registration::Reregistered)
                }
            }
            None => {
                tracing::info!(
                    "Peer {} registered at {} ({} cpu, {} bytes storage, {} bps)",
                    peer_id,
                    addr,
                    capabilities.cpu_units,
                    capabilities.storage_bytes,
                    capabilities.bandwidth_bps
                );
                peers.insert(
                    peer_id.clone(),
                    PeerRecord {
                        peer_id,
                        addr,
                        capabilities,
                        used_storage: 0,
                        last_heartbeat: now,
                        status: PeerStatus::Online,
                        active_transfers: 0,
                        stats: TransferStats::default(),
                    },
                );
                Ok(Registration::Registered)
            }
        }
    }

    /// Records liveness and storage usage. Unknown peers get `NotFound`.
    pub fn heartbeat(&self, peer_id: &PeerId, used_storage: u64, now: Instant) -> Result<HeartbeatOutcome> {
        let mut peers = self.peers.write();
        let record = peers
            .get_mut(peer_id)
            .ok_or_else(|| ClusterError::NotFound(format!("peer {}", peer_id)))?;

        if used_storage > record.capabilities.storage_bytes {
            tracing::warn!(
                "Peer {} reports {} bytes used of {}; clamping",
                peer_id,
                used_storage,
                record.capabilities.storage_bytes
            );
        }
        record.used_storage = used_storage.min(record.capabilities.storage_bytes);
        record.last_heartbeat = now;

        let outcome = match record.status {
            PeerStatus::Online => HeartbeatOutcome::Alive,
            PeerStatus::Suspected => {
                tracing::info!("Peer {} refuted suspicion", peer_id);
                HeartbeatOutcome::Refuted
            }
            PeerStatus::Offline => {
                tracing::info!("Peer {} is back online", peer_id);
                HeartbeatOutcome::Recovered
            }
        };
        record.status = PeerStatus::Online;
        Ok(outcome)
    }

    /// Advances the detector. Each transition is reported once.
    pub fn sweep(&self, now: Instant) -> Vec<PeerEvent> {
        let offline_after = self.heartbeat_timeout + self.offline_grace;
        let mut events = Vec::new();
        let mut peers = self.peers.write();

        for record in peers.values_mut() {
            let silent = now.saturating_duration_since(record.last_heartbeat);
            match record.status {
                PeerStatus::Online if silent > offline_after => {
                    // Missed a whole sweep window; report both steps in order.
                    record.status = PeerStatus::Offline;
                    events.push(PeerEvent::Suspected(record.peer_id.clone()));
                    events.push(PeerEvent::Offline(record.peer_id.clone()));
                }
                PeerStatus::Online if silent > self.heartbeat_timeout => {
                    record.status = PeerStatus::Suspected;
                    events.push(PeerEvent::Suspected(record.peer_id.clone()));
                }
                PeerStatus::Suspected if silent > offline_after => {
                    record.status = PeerStatus::Offline;
                    events.push(PeerEvent::Offline(record.peer_id.clone()));
                }
                _ => {}
            }
        }

        for event in &events {
            match event {
                PeerEvent::Suspected(id) => tracing::warn!("Peer {} suspected", id),
                PeerEvent::Offline(id) => tracing::warn!("Peer {} declared offline", id),
                _ => {}
            }
        }
        events
    }

    /// Consistent copy of every record, ordered by peer-id.
    pub fn snapshot(&self) -> Vec<PeerSummary> {
        self.peers.read().values().map(PeerRecord::summary).collect()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerSummary> {
        self.peers.read().get(peer_id).map(PeerRecord::summary)
    }

    pub fn status(&self, peer_id: &PeerId) -> Option<PeerStatus> {
        self.peers.read().get(peer_id).map(|r| r.status)
    }

    pub fn is_online(&self, peer_id: &PeerId) -> bool {
        self.status(peer_id) == Some(PeerStatus::Online)
    }

    pub fn begin_transfer(&self, peer_id: &PeerId) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.active_transfers += 1;
        }
    }

    pub fn end_transfer(&self, peer_id: &PeerId) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.active_transfers = record.active_transfers.saturating_sub(1);
        }
    }

    /// Adds one transfer outcome to the peer's history.
    pub fn record_transfer(&self, peer_id: &PeerId, bytes: u64, elapsed: Duration, success: bool) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.stats.record(bytes, elapsed, success);
        }
    }
}
