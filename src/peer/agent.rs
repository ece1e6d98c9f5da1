//! Peer Agent
//!
//! The long-running process on every storage peer.
//!
//! ## Responsibilities
//! - **Membership**: registers at start-up and heartbeats with its used
//!   storage; re-registers when the coordinator no longer knows it.
//! - **Creation**: admits, generates and stores files, then tells the
//!   coordinator with bounded exponential backoff.
//! - **Serving**: answers chunk requests from other peers.
//! - **Receiving**: runs transfer sessions for replica orders and downloads,
//!   committing the staged copy only when every chunk arrived intact.

use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::client::PeerTransport;
use super::retry::Backoff;
use super::store::{LocalStore, StagedFile, StoredFile};
use crate::config::PeerConfig;
use crate::coordinator::protocol::{ControlRequest, ControlResponse, DownloadPlan, ReplicateOrder};
use crate::coordinator::types::{BYTES_PER_GB, Capabilities};
use crate::error::{ClusterError, Result};
use crate::transfer::planner::ChunkSpan;
use crate::transfer::progress::TransferProgress;
use crate::transfer::session::TransferSession;
use crate::types::{FileId, PeerId, now_ms};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What an operator declares about a peer.
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub peer_id: PeerId,
    /// Data-plane address other peers use to reach this one.
    pub addr: String,
    pub cpu: u32,
    pub memory_gb: u32,
    pub storage_gb: u64,
    pub bandwidth_mbps: u64,
}

impl PeerSpec {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_units(self.cpu, self.memory_gb, self.storage_gb, self.bandwidth_mbps)
    }
}

/// The address other peers should dial. Defaults to `bind`, which must then
/// name a concrete interface.
pub fn advertise_addr(bind: SocketAddr, advertise: Option<&str>) -> Result<String> {
    match advertise.map(str::trim) {
        Some("") => Err(ClusterError::Protocol("advertise address must not be empty".to_string())),
        Some(addr) => Ok(addr.to_string()),
        None if bind.ip().is_unspecified() => Err(ClusterError::Protocol(format!(
            "bind address {} is not reachable by other peers; pass an advertise address",
            bind
        ))),
        None => Ok(bind.to_string()),
    }
}

/// Events for local observers (menus, progress bars).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    FileCreated {
        file_id: FileId,
        name: String,
        size_bytes: u64,
    },
    TransferProgress(TransferProgress),
    TransferFinished {
        file_id: FileId,
        success: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Stored locally and known to the coordinator.
    Registered { file_id: FileId },
    /// Stored locally only; the coordinator never acknowledged it.
    LocalOnly { file_id: FileId, reason: String },
}

impl CreateOutcome {
    pub fn file_id(&self) -> &FileId {
        match self {
            CreateOutcome::Registered { file_id } | CreateOutcome::LocalOnly { file_id, .. } => file_id,
        }
    }
}

/// Handle on a file creation running in the background. Dropping it lets
/// the creation finish unobserved.
pub struct CreateTicket {
    file_id: FileId,
    handle: JoinHandle<Result<CreateOutcome>>,
}

impl CreateTicket {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub async fn wait(self) -> Result<CreateOutcome> {
        self.handle
            .await
            .map_err(|e| ClusterError::Resource(format!("file creation task failed: {}", e)))?
    }
}

/// Decrements the active-session counter when a transfer ends.
struct SessionSlot<'a>(&'a AtomicUsize);

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PeerAgent {
    spec: PeerSpec,
    config: PeerConfig,
    store: Arc<LocalStore>,
    transport: Arc<dyn PeerTransport>,
    active_sessions: AtomicUsize,
    events: broadcast::Sender<AgentEvent>,
}

impl PeerAgent {
    pub fn new(spec: PeerSpec, config: PeerConfig, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let store = Arc::new(LocalStore::new(spec.storage_gb.saturating_mul(BYTES_PER_GB)));
        Self::with_store(spec, config, transport, store)
    }

    pub fn with_store(
        spec: PeerSpec,
        config: PeerConfig,
        transport: Arc<dyn PeerTransport>,
        store: Arc<LocalStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            spec,
            config,
            store,
            transport,
            active_sessions: AtomicUsize::new(0),
            events,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.spec.peer_id
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Worker slots left for a new transfer: one per CPU unit, minus the
    /// sessions already running.
    pub fn available_slots(&self) -> usize {
        (self.spec.cpu as usize).saturating_sub(self.active_sessions.load(Ordering::SeqCst))
    }

    async fn call(&self, request: ControlRequest, timeout: Duration) -> Result<ControlResponse> {
        tokio::time::timeout(timeout, self.transport.control(request)).await?
    }

    // --- Membership ---

    pub async fn register(&self) -> Result<()> {
        let request = ControlRequest::Register {
            peer_id: self.spec.peer_id.clone(),
            addr: self.spec.addr.clone(),
            cpu: self.spec.cpu,
            memory_gb: self.spec.memory_gb,
            storage_gb: self.spec.storage_gb,
            bandwidth_mbps: self.spec.bandwidth_mbps,
        };

        match self.call(request, self.config.control_timeout).await? {
            ControlResponse::Register { accepted: true, .. } => {
                tracing::info!("Peer {} registered with coordinator", self.spec.peer_id);
                Ok(())
            }
            ControlResponse::Register {
                accepted: false,
                reason,
            } => Err(ClusterError::Conflict(
                reason.unwrap_or_else(|| "registration refused".to_string()),
            )),
            other => Err(unexpected("Register", &other)),
        }
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let request = ControlRequest::Heartbeat {
            peer_id: self.spec.peer_id.clone(),
            used_storage_bytes: self.store.used(),
            timestamp: now_ms(),
        };
        match self.call(request, self.config.control_timeout).await? {
            ControlResponse::Heartbeat { .. } => Ok(()),
            other => Err(unexpected("Heartbeat", &other)),
        }
    }

    /// Spawns the heartbeat emitter.
    pub async fn start(self: Arc<Self>) {
        tracing::info!(
            "Starting peer agent {} (heartbeat every {:?})",
            self.spec.peer_id,
            self.config.heartbeat_interval
        );

        let _heartbeat_handle = {
            let agent = self.clone();
            tokio::spawn(async move {
                agent.heartbeat_loop().await;
            })
        };
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            interval.tick().await;

            match self.send_heartbeat().await {
                Ok(()) => tracing::trace!("Heartbeat from {} acknowledged", self.spec.peer_id),
                Err(ClusterError::NotFound(_)) => {
                    tracing::warn!("Coordinator forgot {}; re-registering", self.spec.peer_id);
                    if let Err(e) = self.register().await {
                        tracing::error!("Re-registration of {} failed: {}", self.spec.peer_id, e);
                    }
                }
                Err(e) => tracing::warn!("Heartbeat from {} failed: {}", self.spec.peer_id, e),
            }
        }
    }

    // --- Creation ---

    /// Creates a file of `size_bytes` random bytes and announces it.
    ///
    /// Admission happens before this returns, so a full peer fails fast with
    /// `Resource`. Everything else runs in the background behind the ticket.
    pub fn create_file(
        self: &Arc<Self>,
        name: impl Into<String>,
        size_bytes: u64,
        replication_factor: u32,
    ) -> Result<CreateTicket> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ClusterError::Protocol("file name must not be empty".to_string()));
        }
        if replication_factor == 0 {
            return Err(ClusterError::Protocol("replication factor must be at least 1".to_string()));
        }

        let reservation = self.store.try_reserve(size_bytes)?;
        let file_id = FileId::generate();
        tracing::info!(
            "Creating file {} ({}, {} bytes, R={}); {} bytes left",
            file_id,
            name,
            size_bytes,
            replication_factor,
            self.store.free()
        );

        let agent = self.clone();
        let id = file_id.clone();
        let handle = tokio::spawn(async move {
            let bytes = if size_bytes >= agent.config.background_create_threshold {
                tokio::task::spawn_blocking(move || generate_content(size_bytes))
                    .await
                    .map_err(|e| ClusterError::Resource(format!("content generation failed: {}", e)))?
            } else {
                generate_content(size_bytes)
            };

            agent.store.insert(
                StoredFile {
                    file_id: id.clone(),
                    name: name.clone(),
                    bytes: Arc::new(bytes),
                    created_at_ms: now_ms(),
                },
                reservation,
            )?;
            let _ = agent.events.send(AgentEvent::FileCreated {
                file_id: id.clone(),
                name: name.clone(),
                size_bytes,
            });

            let outcome = agent
                .notify_with_backoff(id, name, size_bytes, replication_factor)
                .await;
            Ok::<_, ClusterError>(outcome)
        });

        Ok(CreateTicket { file_id, handle })
    }

    /// Tells the coordinator about a new file, retrying with backoff. Gives up
    /// with `LocalOnly` once the attempt budget is spent.
    pub async fn notify_with_backoff(
        &self,
        file_id: FileId,
        name: String,
        size_bytes: u64,
        replication_factor: u32,
    ) -> CreateOutcome {
        let request = ControlRequest::NotifyFileCreated {
            file_id: file_id.clone(),
            name,
            size_bytes,
            owner_peer_id: self.spec.peer_id.clone(),
            replication_factor,
        };

        let mut backoff = Backoff::new(self.config.notify);
        let mut last_error = String::from("no attempt made");

        while let Some(attempt) = backoff.next_attempt() {
            match self.call(request.clone(), attempt.timeout).await {
                Ok(ControlResponse::NotifyFileCreated { accepted: true }) => {
                    tracing::info!(
                        "Coordinator acknowledged file {} on attempt {}",
                        file_id,
                        attempt.number
                    );
                    return CreateOutcome::Registered { file_id };
                }
                Ok(other) => {
                    last_error = unexpected("NotifyFileCreated", &other).to_string();
                }
                Err(ClusterError::NotFound(message)) => {
                    // The coordinator lost us (restart or OFFLINE); rejoin and retry.
                    last_error = message;
                    if let Err(e) = self.register().await {
                        tracing::warn!("Re-registration before notify failed: {}", e);
                    }
                }
                Err(e @ (ClusterError::Conflict(_) | ClusterError::Resource(_))) => {
                    tracing::error!("Coordinator rejected file {}: {}", file_id, e);
                    return CreateOutcome::LocalOnly {
                        file_id,
                        reason: e.to_string(),
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        "Notify for file {} attempt {} failed: {}",
                        file_id,
                        attempt.number,
                        e
                    );
                    last_error = e.to_string();
                }
            }

            if !backoff.exhausted() {
                tokio::time::sleep(backoff.delay()).await;
            }
        }

        tracing::error!(
            "File {} stays local only after {} attempts: {}",
            file_id,
            backoff.attempts_made(),
            last_error
        );
        CreateOutcome::LocalOnly {
            file_id,
            reason: last_error,
        }
    }

    // --- Serving ---

    /// Encoded frame for chunk `sequence_index` of a local file.
    pub fn serve_chunk(&self, file_id: &FileId, sequence_index: u32) -> Result<Vec<u8>> {
        self.store.read_chunk(file_id, sequence_index)?.encode()
    }

    // --- Receiving ---

    /// Executes a replica order from the coordinator. Returns bytes stored.
    pub async fn replicate(&self, order: ReplicateOrder) -> Result<u64> {
        if let Some(existing) = self.store.get(&order.file_id) {
            tracing::debug!("Already holding {}; replica order is a no-op", order.file_id);
            return Ok(existing.size());
        }
        self.fetch_into_store(
            order.file_id,
            order.name,
            order.size_bytes,
            order.source_peer_id,
            &order.source_addr,
            order.chunk_plan,
        )
        .await
    }

    /// Pulls `file_id` from the cluster and reports the outcome.
    pub async fn download(&self, file_id: &FileId) -> Result<u64> {
        let request = ControlRequest::RequestDownload {
            file_id: file_id.clone(),
            requester_peer_id: self.spec.peer_id.clone(),
        };
        let plan: DownloadPlan = match self.call(request, self.config.control_timeout).await? {
            ControlResponse::Download(plan) => plan,
            other => return Err(unexpected("RequestDownload", &other)),
        };

        let result = match self.store.get(file_id) {
            Some(existing) => Ok(existing.size()),
            None => {
                self.fetch_into_store(
                    plan.file_id,
                    plan.name,
                    plan.size_bytes,
                    plan.source_peer_id,
                    &plan.source_addr,
                    plan.chunk_plan,
                )
                .await
            }
        };

        let complete = ControlRequest::TransferComplete {
            file_id: file_id.clone(),
            peer_id: self.spec.peer_id.clone(),
            success: result.is_ok(),
        };
        if let Err(e) = self.call(complete, self.config.control_timeout).await {
            tracing::warn!("Could not report download of {}: {}", file_id, e);
        }
        result
    }

    async fn fetch_into_store(
        &self,
        file_id: FileId,
        name: String,
        size_bytes: u64,
        source_peer: PeerId,
        source_addr: &str,
        chunk_plan: Vec<ChunkSpan>,
    ) -> Result<u64> {
        let reservation = self.store.try_reserve(size_bytes)?;
        let slots = self.available_slots();
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        let _slot = SessionSlot(&self.active_sessions);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Arc::new(
            TransferSession::new(
                file_id.clone(),
                source_peer.clone(),
                self.spec.peer_id.clone(),
                size_bytes,
                chunk_plan,
                self.config.transfer.clone(),
            )?
            .with_reporter(tx),
        );

        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let _ = events.send(AgentEvent::TransferProgress(progress));
            }
        });

        let staged = Arc::new(StagedFile::new(size_bytes));
        let source = self.transport.chunk_source(&source_peer, source_addr);
        let outcome = session.run(source, staged.clone(), slots).await;
        // The session held the only sender; the forwarder drains and exits.
        let _ = forwarder.await;

        let result = match outcome {
            Ok(report) => {
                self.store.insert(
                    StoredFile {
                        file_id: file_id.clone(),
                        name,
                        bytes: Arc::new(staged.take()),
                        created_at_ms: now_ms(),
                    },
                    reservation,
                )?;
                Ok(report.bytes_written)
            }
            Err(e) => {
                tracing::warn!("Transfer of {} from {} discarded: {}", file_id, source_peer, e);
                Err(e)
            }
        };

        let _ = self.events.send(AgentEvent::TransferFinished {
            file_id,
            success: result.is_ok(),
        });
        result
    }
}

fn unexpected(operation: &str, response: &ControlResponse) -> ClusterError {
    ClusterError::Protocol(format!("unexpected {} response: {:?}", operation, response))
}

fn generate_content(size_bytes: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; size_bytes as usize];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}
