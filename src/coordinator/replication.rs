//! Replication Coordinator
//!
//! Owns the file table and keeps every file at its replication factor.
//!
//! ## State machine (per file)
//! ```text
//! CREATING -> REPLICATING -> SATISFIED <-> UNDER_REPLICATED -> REPLICATING
//! ```
//! A file is SATISFIED while at least `R` of its holders are ONLINE. Holders
//! are never dropped when a peer goes offline; repair only adds targets, so a
//! file may end up with more than `R` holders once a peer comes back.
//!
//! A SUSPECTED holder still counts towards `R` when deciding whether to copy.
//! Repair starts once a holder is OFFLINE, so a peer that refutes suspicion
//! never causes an extra replica. An in-flight target that goes OFFLINE is
//! dropped from the file and its share of the deficit is planned again.
//!
//! Replica orders run as spawned tasks. Their completion re-enters the file
//! table through [`ReplicationCoordinator::complete_replica`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::placement::{PlacementPolicy, select_source};
use super::protocol::{DownloadPlan, FileSummary, ReplicateOrder};
use super::registry::NodeRegistry;
use super::types::{FileRecord, PeerEvent, PeerSummary, ReplicationState};
use crate::error::{ClusterError, Result};
use crate::transfer::planner::plan_chunks;
use crate::types::{FileId, PeerId, now_ms};

/// Delivers a replica order to its target peer and waits for the outcome.
#[async_trait]
pub trait ReplicaLauncher: Send + Sync {
    async fn replicate(&self, target: &PeerSummary, order: ReplicateOrder) -> Result<()>;
}

/// A file announced by its owner.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub file_id: FileId,
    pub name: String,
    pub size_bytes: u64,
    pub owner: PeerId,
    pub replication_factor: u32,
}

struct PlannedOrder {
    target: PeerSummary,
    source: PeerId,
    order: ReplicateOrder,
}

type PeerTable = BTreeMap<PeerId, PeerSummary>;

/// A download handed out by `plan_download` and not yet reported back.
struct OpenDownload {
    source: PeerId,
    size_bytes: u64,
    started: Instant,
}

pub struct ReplicationCoordinator {
    registry: Arc<NodeRegistry>,
    placement: Arc<dyn PlacementPolicy>,
    launcher: Arc<dyn ReplicaLauncher>,
    order_timeout: Duration,
    transfer_cap: u32,
    files: RwLock<BTreeMap<FileId, FileRecord>>,
    downloads: Mutex<HashMap<(FileId, PeerId), OpenDownload>>,
}

impl ReplicationCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        placement: Arc<dyn PlacementPolicy>,
        launcher: Arc<dyn ReplicaLauncher>,
        order_timeout: Duration,
        transfer_cap: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            placement,
            launcher,
            order_timeout,
            transfer_cap,
            files: RwLock::new(BTreeMap::new()),
            downloads: Mutex::new(HashMap::new()),
        })
    }

    /// Records a new file and orders its first `R - 1` replicas.
    ///
    /// Re-announcing a known file-id is accepted and changes nothing.
    pub fn notify_file_created(self: &Arc<Self>, file: NewFile) -> Result<bool> {
        if file.replication_factor == 0 {
            return Err(ClusterError::Protocol(format!(
                "file {} announced with replication factor 0",
                file.file_id
            )));
        }
        if file.name.trim().is_empty() {
            return Err(ClusterError::Protocol(format!(
                "file {} announced without a name",
                file.file_id
            )));
        }
        if self.registry.get(&file.owner).is_none() {
            return Err(ClusterError::NotFound(format!("owner peer {}", file.owner)));
        }

        let peers = self.peer_table();
        let planned = {
            let mut files = self.files.write();
            if files.contains_key(&file.file_id) {
                tracing::debug!("File {} already known; ignoring duplicate notify", file.file_id);
                return Ok(true);
            }

            let mut record = FileRecord::new(
                file.file_id.clone(),
                file.name,
                file.size_bytes,
                file.owner,
                file.replication_factor,
                now_ms(),
            );
            tracing::info!(
                "File {} ({}, {} bytes) created on {} with R={}",
                record.file_id,
                record.name,
                record.size_bytes,
                record.owner,
                record.replication_factor
            );

            record.state = ReplicationState::Replicating;
            let planned = self.plan_repair(&mut record, &peers);
            refresh_state(&mut record, &peers);
            files.insert(record.file_id.clone(), record);
            planned
        };

        self.launch(planned);
        Ok(true)
    }

    /// Applies the outcome of one replica order.
    pub fn complete_replica(&self, file_id: &FileId, target: &PeerId, success: bool) {
        let peers = self.peer_table();
        let mut files = self.files.write();
        let Some(record) = files.get_mut(file_id) else {
            tracing::warn!("Replica result for unknown file {}", file_id);
            return;
        };

        record.pending.remove(target);
        if success {
            record.holders.insert(target.clone());
            tracing::info!("Peer {} now holds file {}", target, file_id);
        } else {
            tracing::warn!("Replica of file {} on {} failed", file_id, target);
        }
        refresh_state(record, &peers);
    }

    /// Reacts to a registry transition. Returns the files that already had
    /// a placement request for this event.
    pub fn handle_peer_event(self: &Arc<Self>, event: &PeerEvent) -> BTreeSet<FileId> {
        match event {
            PeerEvent::Offline(peer_id) => {
                let peers = self.peer_table();
                let mut handled = BTreeSet::new();
                let planned: Vec<PlannedOrder> = {
                    let mut files = self.files.write();
                    let mut planned = Vec::new();
                    for record in files.values_mut() {
                        let was_pending = record.pending.remove(peer_id);
                        if was_pending {
                            tracing::warn!(
                                "Replica of {} on {} abandoned: target went offline",
                                record.file_id,
                                peer_id
                            );
                        }
                        if !was_pending && !record.holders.contains(peer_id) {
                            continue;
                        }
                        if online_holders(record, &peers) >= record.replication_factor as usize {
                            continue;
                        }

                        tracing::warn!(
                            "File {} under-replicated after {} went offline",
                            record.file_id,
                            peer_id
                        );
                        record.state = ReplicationState::UnderReplicated;
                        planned.extend(self.plan_repair(record, &peers));
                        refresh_state(record, &peers);
                        handled.insert(record.file_id.clone());
                    }
                    planned
                };
                self.launch(planned);
                handled
            }
            PeerEvent::Recovered(peer_id) | PeerEvent::Registered(peer_id) => {
                let peers = self.peer_table();
                let mut files = self.files.write();
                for record in files.values_mut().filter(|r| r.holders.contains(peer_id)) {
                    if online_holders(record, &peers) >= record.replication_factor as usize
                        && record.state != ReplicationState::Satisfied
                    {
                        tracing::info!("File {} satisfied again after {} returned", record.file_id, peer_id);
                        record.state = ReplicationState::Satisfied;
                    }
                }
                BTreeSet::new()
            }
            PeerEvent::Suspected(_) => BTreeSet::new(),
        }
    }

    /// Re-issues repair for every file in deficit with nothing in flight,
    /// except those in `skip`. Holders that are only SUSPECTED still count.
    /// Returns the number of replica orders launched.
    pub fn repair_cycle(self: &Arc<Self>, skip: &BTreeSet<FileId>) -> usize {
        let peers = self.peer_table();
        let planned: Vec<PlannedOrder> = {
            let mut files = self.files.write();
            let mut planned = Vec::new();
            for record in files.values_mut() {
                let r = record.replication_factor as usize;
                if online_holders(record, &peers) >= r {
                    record.state = ReplicationState::Satisfied;
                    continue;
                }
                if skip.contains(&record.file_id)
                    || !record.pending.is_empty()
                    || present_holders(record, &peers) >= r
                {
                    continue;
                }
                record.state = ReplicationState::UnderReplicated;
                planned.extend(self.plan_repair(record, &peers));
                refresh_state(record, &peers);
            }
            planned
        };

        let issued = planned.len();
        if issued > 0 {
            tracing::info!("Repair cycle issued {} replica order(s)", issued);
        }
        self.launch(planned);
        issued
    }

    /// Adds `peer` as a holder of `file_id` (a completed download).
    pub fn mark_holder(&self, file_id: &FileId, peer: &PeerId) -> Result<()> {
        let peers = self.peer_table();
        let mut files = self.files.write();
        let record = files
            .get_mut(file_id)
            .ok_or_else(|| ClusterError::NotFound(format!("file {}", file_id)))?;

        record.pending.remove(peer);
        if record.holders.insert(peer.clone()) {
            tracing::info!("Peer {} holds file {} after download", peer, file_id);
        }
        refresh_state(record, &peers);
        Ok(())
    }

    /// Chooses a source for `requester` and returns the fetch plan.
    pub fn plan_download(&self, file_id: &FileId, requester: &PeerId) -> Result<DownloadPlan> {
        let (name, size_bytes, holders) = {
            let files = self.files.read();
            let record = files
                .get(file_id)
                .ok_or_else(|| ClusterError::NotFound(format!("file {}", file_id)))?;
            (record.name.clone(), record.size_bytes, record.holders.clone())
        };

        let holder_peers: Vec<PeerSummary> = holders
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        let source = select_source(&holder_peers, Some(requester), self.transfer_cap).ok_or_else(|| {
            ClusterError::Resource(format!("no online holder for file {}", file_id))
        })?;

        self.registry.begin_transfer(&source.peer_id);
        self.downloads.lock().insert(
            (file_id.clone(), requester.clone()),
            OpenDownload {
                source: source.peer_id.clone(),
                size_bytes,
                started: Instant::now(),
            },
        );

        tracing::info!(
            "Download of {} by {} will pull from {}",
            file_id,
            requester,
            source.peer_id
        );
        Ok(DownloadPlan {
            file_id: file_id.clone(),
            name,
            source_peer_id: source.peer_id.clone(),
            source_addr: source.addr.clone(),
            size_bytes,
            chunk_plan: plan_chunks(size_bytes),
        })
    }

    /// Closes a download opened by `plan_download`.
    pub fn finish_download(&self, file_id: &FileId, requester: &PeerId, success: bool) -> Result<()> {
        let open = self
            .downloads
            .lock()
            .remove(&(file_id.clone(), requester.clone()));
        if let Some(open) = open {
            self.registry.end_transfer(&open.source);
            self.registry
                .record_transfer(&open.source, open.size_bytes, open.started.elapsed(), success);
        }

        if success {
            self.mark_holder(file_id, requester)
        } else {
            tracing::warn!("Download of {} by {} failed", file_id, requester);
            Ok(())
        }
    }

    pub fn list_files(&self) -> Vec<FileSummary> {
        self.files.read().values().map(summarize).collect()
    }

    pub fn get(&self, file_id: &FileId) -> Option<FileRecord> {
        self.files.read().get(file_id).cloned()
    }

    fn peer_table(&self) -> PeerTable {
        self.registry
            .snapshot()
            .into_iter()
            .map(|peer| (peer.peer_id.clone(), peer))
            .collect()
    }

    /// Asks placement once for the file's current deficit and marks the chosen
    /// targets in flight.
    fn plan_repair(&self, record: &mut FileRecord, peers: &PeerTable) -> Vec<PlannedOrder> {
        let have = present_holders(record, peers) + record.pending.len();
        let want = (record.replication_factor as usize).saturating_sub(have);
        if want == 0 {
            return Vec::new();
        }

        let Some(source) = repair_source(record, peers) else {
            tracing::warn!("File {} has no online holder to copy from", record.file_id);
            return Vec::new();
        };

        let candidates: Vec<PeerSummary> = peers.values().cloned().collect();
        let targets = self
            .placement
            .select_targets(&candidates, &record.excluded(), record.size_bytes, want);
        if targets.len() < want {
            tracing::warn!(
                "File {} needs {} more replica(s), placement found {}",
                record.file_id,
                want,
                targets.len()
            );
        }

        let chunk_plan = plan_chunks(record.size_bytes);
        targets
            .into_iter()
            .filter_map(|id| peers.get(&id).cloned())
            .map(|target| {
                record.pending.insert(target.peer_id.clone());
                PlannedOrder {
                    order: ReplicateOrder {
                        file_id: record.file_id.clone(),
                        name: record.name.clone(),
                        size_bytes: record.size_bytes,
                        source_peer_id: source.peer_id.clone(),
                        source_addr: source.addr.clone(),
                        chunk_plan: chunk_plan.clone(),
                    },
                    source: source.peer_id.clone(),
                    target,
                }
            })
            .collect()
    }

    fn launch(self: &Arc<Self>, planned: Vec<PlannedOrder>) {
        for PlannedOrder { target, source, order } in planned {
            tracing::info!(
                "Ordering replica of {} onto {} from {}",
                order.file_id,
                target.peer_id,
                source
            );
            self.registry.begin_transfer(&source);

            let this = self.clone();
            tokio::spawn(async move {
                let file_id = order.file_id.clone();
                let size_bytes = order.size_bytes;
                let started = Instant::now();
                let result = tokio::time::timeout(this.order_timeout, this.launcher.replicate(&target, order))
                    .await
                    .unwrap_or_else(|elapsed| Err(elapsed.into()));

                this.registry.end_transfer(&source);
                this.registry
                    .record_transfer(&target.peer_id, size_bytes, started.elapsed(), result.is_ok());
                if let Err(e) = &result {
                    tracing::warn!("Replica order for {} on {} failed: {}", file_id, target.peer_id, e);
                }
                this.complete_replica(&file_id, &target.peer_id, result.is_ok());
            });
        }
    }
}

fn online_holders(record: &FileRecord, peers: &PeerTable) -> usize {
    record
        .holders
        .iter()
        .filter(|id| peers.get(*id).is_some_and(PeerSummary::is_online))
        .count()
}

/// Holders not yet declared OFFLINE.
fn present_holders(record: &FileRecord, peers: &PeerTable) -> usize {
    record
        .holders
        .iter()
        .filter(|id| peers.get(*id).is_some_and(PeerSummary::is_present))
        .count()
}

/// The owner if it is ONLINE, else the first ONLINE holder.
fn repair_source<'a>(record: &FileRecord, peers: &'a PeerTable) -> Option<&'a PeerSummary> {
    peers
        .get(&record.owner)
        .filter(|owner| owner.is_online())
        .or_else(|| {
            record
                .holders
                .iter()
                .filter_map(|id| peers.get(id))
                .find(|peer| peer.is_online())
        })
}

fn refresh_state(record: &mut FileRecord, peers: &PeerTable) {
    record.state = if online_holders(record, peers) >= record.replication_factor as usize {
        ReplicationState::Satisfied
    } else if !record.pending.is_empty() {
        ReplicationState::Replicating
    } else {
        ReplicationState::UnderReplicated
    };
}

fn summarize(record: &FileRecord) -> FileSummary {
    FileSummary {
        file_id: record.file_id.clone(),
        name: record.name.clone(),
        size_bytes: record.size_bytes,
        owner_peer_id: record.owner.clone(),
        holders: record.holders.iter().cloned().collect(),
        replication_factor: record.replication_factor,
        state: record.state,
        created_at_ms: record.created_at_ms,
    }
}
