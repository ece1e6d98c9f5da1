//! Coordinator Service
//!
//! Ties the registry, placement and replication together behind one
//! exhaustive control-plane dispatcher, and runs the detector/repair timer.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::placement::{PlacementPolicy, WeightedPlacement};
use super::protocol::{ControlRequest, ControlResponse};
use super::registry::NodeRegistry;
use super::replication::{NewFile, ReplicaLauncher, ReplicationCoordinator};
use super::types::{Capabilities, HeartbeatOutcome, PeerEvent, Registration};
use crate::config::CoordinatorConfig;
use crate::error::{ClusterError, Result};
use crate::types::FileId;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<NodeRegistry>,
    replication: Arc<ReplicationCoordinator>,
    events: broadcast::Sender<PeerEvent>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, launcher: Arc<dyn ReplicaLauncher>) -> Arc<Self> {
        let placement = Arc::new(
            WeightedPlacement::new(config.placement, config.transfer_slots_per_peer)
                .with_transfer_cap(config.max_concurrent_transfers),
        );
        Self::with_placement(config, placement, launcher)
    }

    pub fn with_placement(
        config: CoordinatorConfig,
        placement: Arc<dyn PlacementPolicy>,
        launcher: Arc<dyn ReplicaLauncher>,
    ) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new(&config));
        let replication = ReplicationCoordinator::new(
            registry.clone(),
            placement,
            launcher,
            config.replica_order_timeout,
            config.max_concurrent_transfers,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            config,
            registry,
            replication,
            events,
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn replication(&self) -> &Arc<ReplicationCoordinator> {
        &self.replication
    }

    /// Node-status events for observers (dashboards, logs).
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Spawns the failure-detector sweep and repair cycle.
    pub async fn start(self: Arc<Self>) {
        tracing::info!(
            "Starting coordinator (timeout {:?}, grace {:?}, sweep every {:?})",
            self.config.heartbeat_timeout,
            self.config.offline_grace,
            self.config.sweep_interval
        );

        let _sweep_handle = {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.sweep_loop().await;
            })
        };
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);

        loop {
            interval.tick().await;
            self.tick(Instant::now());
        }
    }

    /// One detector pass followed by one repair cycle. Files already handled
    /// by an OFFLINE transition in this pass are not planned again.
    pub fn tick(&self, now: Instant) {
        let mut handled = BTreeSet::new();
        for event in self.registry.sweep(now) {
            handled.extend(self.publish(event));
        }
        self.replication.repair_cycle(&handled);
    }

    fn publish(&self, event: PeerEvent) -> BTreeSet<FileId> {
        let handled = self.replication.handle_peer_event(&event);
        // No subscribers is fine.
        let _ = self.events.send(event);
        handled
    }

    /// Answers one control-plane request. Never panics on bad input.
    pub fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let name = request.name();
        match self.handle(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("{} rejected: {}", name, e);
                e.into()
            }
        }
    }

    fn handle(&self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::Register {
                peer_id,
                addr,
                cpu,
                memory_gb,
                storage_gb,
                bandwidth_mbps,
            } => {
                let capabilities = Capabilities::from_units(cpu, memory_gb, storage_gb, bandwidth_mbps);
                match self
                    .registry
                    .register(peer_id.clone(), capabilities, addr, Instant::now())
                {
                    Ok(Registration::Registered) => {
                        self.publish(PeerEvent::Registered(peer_id));
                    }
                    Ok(Registration::Recovered) => {
                        self.publish(PeerEvent::Recovered(peer_id));
                    }
                    Ok(Registration::Reregistered) => {}
                    Err(ClusterError::Conflict(reason)) => {
                        tracing::warn!("Registration of {} refused: {}", peer_id, reason);
                        return Ok(ControlResponse::Register {
                            accepted: false,
                            reason: Some(reason),
                        });
                    }
                    Err(e) => return Err(e),
                }
                Ok(ControlResponse::Register {
                    accepted: true,
                    reason: None,
                })
            }

            ControlRequest::Heartbeat {
                peer_id,
                used_storage_bytes,
                timestamp: _,
            } => {
                let outcome = self
                    .registry
                    .heartbeat(&peer_id, used_storage_bytes, Instant::now())?;
                if outcome == HeartbeatOutcome::Recovered {
                    self.publish(PeerEvent::Recovered(peer_id));
                }
                Ok(ControlResponse::Heartbeat { ack: true })
            }

            ControlRequest::NotifyFileCreated {
                file_id,
                name,
                size_bytes,
                owner_peer_id,
                replication_factor,
            } => {
                let accepted = self.replication.notify_file_created(NewFile {
                    file_id,
                    name,
                    size_bytes,
                    owner: owner_peer_id,
                    replication_factor,
                })?;
                Ok(ControlResponse::NotifyFileCreated { accepted })
            }

            ControlRequest::ListFiles => Ok(ControlResponse::Files {
                files: self.replication.list_files(),
            }),

            ControlRequest::RequestDownload {
                file_id,
                requester_peer_id,
            } => {
                let plan = self.replication.plan_download(&file_id, &requester_peer_id)?;
                Ok(ControlResponse::Download(plan))
            }

            ControlRequest::TransferComplete {
                file_id,
                peer_id,
                success,
            } => {
                self.replication.finish_download(&file_id, &peer_id, success)?;
                Ok(ControlResponse::Ack)
            }

            ControlRequest::ListPeers => Ok(ControlResponse::Peers {
                peers: self.registry.snapshot(),
            }),
        }
    }
}
