//! Placement / Load Balancer
//!
//! Chooses replica targets by a weighted score over a registry snapshot:
//!
//! ```text
//! score = w_storage * free_storage / capacity
//!       + w_bandwidth * (bandwidth / max_bandwidth) * (1 - active / slots)
//!       + w_cpu * cpu / max_cpu
//!       + w_performance * performance
//! ```
//!
//! Every term lies in [0, 1]. Maxima are taken over the eligible candidates.
//! `performance` comes from the peer's transfer history and carries no weight
//! unless configured. Peers at their concurrent-transfer cap are skipped.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::types::PeerSummary;
use crate::config::{MAX_CONCURRENT_TRANSFERS_PER_PEER, PlacementWeights};
use crate::types::PeerId;

/// Replica target selection. Returning fewer than `count` peers is allowed;
/// an empty result means nobody qualifies.
pub trait PlacementPolicy: Send + Sync {
    fn select_targets(
        &self,
        candidates: &[PeerSummary],
        exclude: &BTreeSet<PeerId>,
        file_size: u64,
        count: usize,
    ) -> Vec<PeerId>;
}

pub struct WeightedPlacement {
    weights: PlacementWeights,
    transfer_slots: u32,
    transfer_cap: u32,
}

impl WeightedPlacement {
    pub fn new(weights: PlacementWeights, transfer_slots: u32) -> Self {
        if !weights.is_normalized() {
            tracing::warn!("Placement weights {:?} do not sum to 1", weights);
        }
        Self {
            weights,
            transfer_slots: transfer_slots.max(1),
            transfer_cap: MAX_CONCURRENT_TRANSFERS_PER_PEER,
        }
    }

    pub fn with_transfer_cap(mut self, cap: u32) -> Self {
        self.transfer_cap = cap.max(1);
        self
    }

    /// Scores `eligible` peers against each other, highest first.
    pub fn rank<'a>(&self, eligible: &[&'a PeerSummary]) -> Vec<(&'a PeerSummary, f64)> {
        let max_bandwidth = eligible
            .iter()
            .map(|p| p.capabilities.bandwidth_bps)
            .max()
            .unwrap_or(0);
        let max_cpu = eligible
            .iter()
            .map(|p| p.capabilities.cpu_units)
            .max()
            .unwrap_or(0);

        let mut scored: Vec<(&PeerSummary, f64)> = eligible
            .iter()
            .map(|peer| (*peer, self.score(peer, max_bandwidth, max_cpu)))
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        scored
    }

    fn score(&self, peer: &PeerSummary, max_bandwidth: u64, max_cpu: u32) -> f64 {
        let capacity = peer.capabilities.storage_bytes;
        let storage = ratio(peer.free_storage() as f64, capacity as f64);

        let load = f64::from(peer.active_transfers.min(self.transfer_slots))
            / f64::from(self.transfer_slots);
        let bandwidth =
            ratio(peer.capabilities.bandwidth_bps as f64, max_bandwidth as f64) * (1.0 - load);

        let cpu = ratio(f64::from(peer.capabilities.cpu_units), f64::from(max_cpu));

        let performance = peer.stats.performance_score();

        self.weights.storage * storage
            + self.weights.bandwidth * bandwidth
            + self.weights.cpu * cpu
            + self.weights.performance * performance
    }
}

impl PlacementPolicy for WeightedPlacement {
    fn select_targets(
        &self,
        candidates: &[PeerSummary],
        exclude: &BTreeSet<PeerId>,
        file_size: u64,
        count: usize,
    ) -> Vec<PeerId> {
        if count == 0 {
            return Vec::new();
        }

        let eligible: Vec<&PeerSummary> = candidates
            .iter()
            .filter(|p| p.is_online())
            .filter(|p| !exclude.contains(&p.peer_id))
            .filter(|p| p.free_storage() >= file_size)
            .filter(|p| p.active_transfers < self.transfer_cap)
            .collect();

        let chosen: Vec<PeerId> = self
            .rank(&eligible)
            .into_iter()
            .take(count)
            .map(|(peer, _)| peer.peer_id.clone())
            .collect();

        tracing::debug!(
            "Placement: {} of {} candidates eligible, chose {:?} (wanted {})",
            eligible.len(),
            candidates.len(),
            chosen,
            count
        );
        chosen
    }
}

fn ratio(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        0.0
    } else {
        (value / max).clamp(0.0, 1.0)
    }
}

/// Picks the peer a download should pull from.
///
/// Only ONLINE holders qualify. The requester is skipped unless it is the
/// only one left, and holders at `transfer_cap` are skipped unless every
/// holder is. Preference: fewest active transfers, then best transfer
/// history, then highest bandwidth, then lowest peer-id.
pub fn select_source<'a>(
    holders: &'a [PeerSummary],
    requester: Option<&PeerId>,
    transfer_cap: u32,
) -> Option<&'a PeerSummary> {
    let online: Vec<&PeerSummary> = holders.iter().filter(|p| p.is_online()).collect();
    let others: Vec<&PeerSummary> = online
        .iter()
        .copied()
        .filter(|p| Some(&p.peer_id) != requester)
        .collect();
    let pool = if others.is_empty() { online } else { others };
    let unsaturated: Vec<&PeerSummary> = pool
        .iter()
        .copied()
        .filter(|p| p.active_transfers < transfer_cap)
        .collect();
    let pool = if unsaturated.is_empty() { pool } else { unsaturated };

    pool.into_iter().min_by(|a, b| {
        a.active_transfers
            .cmp(&b.active_transfers)
            .then_with(|| {
                b.stats
                    .performance_score()
                    .partial_cmp(&a.stats.performance_score())
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.capabilities.bandwidth_bps.cmp(&a.capabilities.bandwidth_bps))
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    })
}
