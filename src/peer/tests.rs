//! Peer Module Tests
//!
//! ## Test Scopes
//! - **Store**: Capacity reservation, commit and release, staged writes.
//! - **Creation**: Admission, background generation, notify retry with
//!   backoff and the local-only fallback.
//! - **Cluster flows**: Replication and download between agents wired to an
//!   in-process coordinator.
//! - **Membership**: Re-registration when the coordinator forgets a peer;
//!   the address a peer advertises.
//! - **Handlers**: Chunk serving and local creation over the HTTP handlers.

#[cfg(test)]
mod tests {
    use crate::config::{CoordinatorConfig, PeerConfig};
    use crate::coordinator::protocol::{
        ControlRequest, ControlResponse, CreateFileRequest, FetchChunkRequest, ReplicateOrder,
    };
    use crate::coordinator::replication::ReplicaLauncher;
    use crate::coordinator::service::Coordinator;
    use crate::coordinator::types::{PeerSummary, ReplicationState};
    use crate::error::{ClusterError, Result};
    use crate::peer::agent::{AgentEvent, CreateOutcome, PeerAgent, PeerSpec, advertise_addr};
    use crate::peer::client::PeerTransport;
    use crate::peer::handlers::{handle_create, handle_fetch_chunk};
    use crate::peer::store::{LocalStore, StagedFile, StoredFile};
    use crate::transfer::codec::ChunkFrame;
    use crate::transfer::planner::{MIB, chunk_span, plan_chunks};
    use crate::transfer::session::{ChunkSink, ChunkSource};
    use crate::types::{FileId, PeerId};
    use async_trait::async_trait;
    use axum::Json;
    use axum::extract::Extension;
    use axum::http::StatusCode;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    // ============================================================
    // Fakes and helpers
    // ============================================================

    /// Routes control requests straight into a coordinator and chunk
    /// requests into other agents' stores.
    struct LocalTransport {
        coordinator: Arc<Coordinator>,
        stores: Mutex<BTreeMap<PeerId, Arc<LocalStore>>>,
        failing_notifies: AtomicU32,
        calls: Mutex<Vec<&'static str>>,
    }

    impl LocalTransport {
        fn new(coordinator: Arc<Coordinator>) -> Arc<Self> {
            Arc::new(Self {
                coordinator,
                stores: Mutex::new(BTreeMap::new()),
                failing_notifies: AtomicU32::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn count(&self, name: &str) -> usize {
            self.calls.lock().iter().filter(|n| **n == name).count()
        }
    }

    #[async_trait]
    impl PeerTransport for LocalTransport {
        async fn control(&self, request: ControlRequest) -> Result<ControlResponse> {
            self.calls.lock().push(request.name());
            if matches!(request, ControlRequest::NotifyFileCreated { .. }) {
                let failing = self
                    .failing_notifies
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                if failing.is_ok() {
                    return Err(ClusterError::Connection("coordinator unreachable".into()));
                }
            }
            self.coordinator.dispatch(request).into_result()
        }

        fn chunk_source(&self, peer_id: &PeerId, _addr: &str) -> Arc<dyn ChunkSource> {
            let store = self.stores.lock().get(peer_id).cloned();
            match store {
                Some(store) => store as Arc<dyn ChunkSource>,
                None => Arc::new(Unreachable),
            }
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ChunkSource for Unreachable {
        async fn fetch_chunk(&self, _file_id: &FileId, _sequence_index: u32) -> Result<ChunkFrame> {
            Err(ClusterError::Connection("connection refused".into()))
        }
    }

    /// Delivers replica orders to in-process agents.
    #[derive(Default)]
    struct AgentLauncher {
        agents: Mutex<BTreeMap<PeerId, Arc<PeerAgent>>>,
    }

    #[async_trait]
    impl ReplicaLauncher for AgentLauncher {
        async fn replicate(&self, target: &PeerSummary, order: ReplicateOrder) -> Result<()> {
            let agent = self
                .agents
                .lock()
                .get(&target.peer_id)
                .cloned()
                .ok_or_else(|| ClusterError::Connection(format!("no agent {}", target.peer_id)))?;
            agent.replicate(order).await.map(|_| ())
        }
    }

    struct Cluster {
        coordinator: Arc<Coordinator>,
        transport: Arc<LocalTransport>,
        agents: BTreeMap<String, Arc<PeerAgent>>,
    }

    impl Cluster {
        fn agent(&self, id: &str) -> &Arc<PeerAgent> {
            &self.agents[id]
        }

        fn file_state(&self, file_id: &FileId) -> Option<ReplicationState> {
            self.coordinator.replication().get(file_id).map(|r| r.state)
        }
    }

    fn spec(id: &str, storage_gb: u64) -> PeerSpec {
        PeerSpec {
            peer_id: PeerId::new(id),
            addr: format!("{}.local:9000", id),
            cpu: 4,
            memory_gb: 8,
            storage_gb,
            bandwidth_mbps: 1000,
        }
    }

    /// Builds and registers one agent per entry.
    async fn cluster(peers: &[(&str, u64)]) -> Cluster {
        let launcher = Arc::new(AgentLauncher::default());
        let coordinator = Coordinator::new(CoordinatorConfig::default(), launcher.clone());
        let transport = LocalTransport::new(coordinator.clone());

        let mut agents = BTreeMap::new();
        for (id, storage_gb) in peers {
            let agent = PeerAgent::new(spec(id, *storage_gb), PeerConfig::default(), transport.clone());
            transport.stores.lock().insert(PeerId::new(*id), agent.store().clone());
            launcher.agents.lock().insert(PeerId::new(*id), agent.clone());
            agent.register().await.unwrap();
            agents.insert(id.to_string(), agent);
        }

        Cluster {
            coordinator,
            transport,
            agents,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..3000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn stored(id: &str, bytes: Vec<u8>) -> StoredFile {
        StoredFile {
            file_id: FileId(id.to_string()),
            name: format!("{}.bin", id),
            bytes: Arc::new(bytes),
            created_at_ms: 0,
        }
    }

    // ============================================================
    // TEST 1: Store
    // ============================================================

    #[test]
    fn test_reservation_is_released_unless_committed() {
        // ARRANGE
        let store = LocalStore::new(100);

        // ACT
        let dropped = store.try_reserve(60).unwrap();
        let over = store.try_reserve(50);
        drop(dropped);
        let kept = store.try_reserve(50).unwrap();
        store.insert(stored("f", vec![7; 50]), kept).unwrap();

        // ASSERT
        assert!(matches!(over, Err(ClusterError::Resource(_))));
        assert_eq!(store.used(), 50);
        assert_eq!(store.free(), 50);
        assert!(store.contains(&FileId("f".into())));
    }

    #[test]
    fn test_insert_rejects_size_mismatch_and_keeps_first_copy() {
        let store = LocalStore::new(100);

        let wrong = store.try_reserve(10).unwrap();
        let mismatch = store.insert(stored("f", vec![1; 20]), wrong);
        assert!(matches!(mismatch, Err(ClusterError::Protocol(_))));
        assert_eq!(store.used(), 0);

        let first = store.try_reserve(10).unwrap();
        store.insert(stored("f", vec![1; 10]), first).unwrap();
        let second = store.try_reserve(10).unwrap();
        store.insert(stored("f", vec![2; 10]), second).unwrap();

        assert_eq!(store.used(), 10);
        assert_eq!(*store.get(&FileId("f".into())).unwrap().bytes, vec![1; 10]);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_capacity() {
        let store = Arc::new(LocalStore::new(10 * MIB));
        let mut handles = Vec::new();

        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.try_reserve(MIB) }));
        }
        let mut granted = Vec::new();
        for handle in handles {
            if let Ok(reservation) = handle.await.unwrap() {
                granted.push(reservation);
            }
        }

        assert_eq!(granted.len(), 10);
        assert_eq!(store.used(), 10 * MIB);
        drop(granted);
        assert_eq!(store.used(), 0);
    }

    #[test]
    fn test_read_chunk_frames_verify() {
        let store = LocalStore::new(10 * MIB);
        let bytes: Vec<u8> = (0..(2 * MIB + 5)).map(|i| (i % 251) as u8).collect();
        let size = bytes.len() as u64;
        let reservation = store.try_reserve(size).unwrap();
        store.insert(stored("f", bytes.clone()), reservation).unwrap();

        let frame = store.read_chunk(&FileId("f".into()), 2).unwrap();
        let span = chunk_span(size, 2).unwrap();

        frame.verify(&span).unwrap();
        assert_eq!(frame.payload, bytes[2 * MIB as usize..]);
        assert!(matches!(
            store.read_chunk(&FileId("f".into()), 3),
            Err(ClusterError::NotFound(_))
        ));
        assert!(matches!(
            store.read_chunk(&FileId("missing".into()), 0),
            Err(ClusterError::NotFound(_))
        ));
    }

    #[test]
    fn test_staged_file_bounds() {
        let staged = StagedFile::new(8);

        staged.write_at(4, &[1, 2, 3, 4]).unwrap();
        let past_end = staged.write_at(6, &[9, 9, 9]);

        assert!(matches!(past_end, Err(ClusterError::Protocol(_))));
        assert_eq!(staged.take(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    // ============================================================
    // TEST 2: Creation and notify
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_notify_succeeds_on_last_attempt() {
        // ARRANGE: coordinator unreachable for six notifies
        let cluster = cluster(&[("a", 10)]).await;
        cluster.transport.failing_notifies.store(6, Ordering::SeqCst);
        let started = Instant::now();

        // ACT
        let ticket = cluster.agent("a").create_file("notes.txt", 1024, 1).unwrap();
        let file_id = ticket.file_id().clone();
        let outcome = ticket.wait().await.unwrap();

        // ASSERT
        assert_eq!(outcome, CreateOutcome::Registered { file_id: file_id.clone() });
        assert_eq!(cluster.transport.count("NotifyFileCreated"), 7);
        assert_eq!(cluster.file_state(&file_id), Some(ReplicationState::Satisfied));

        // 0.5 + 1 + 2 + 4 + 8 + 16 seconds, plus under 50ms jitter per wait.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(31_500), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(31_800), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_gives_up_and_keeps_file_local() {
        let cluster = cluster(&[("a", 10)]).await;
        cluster.transport.failing_notifies.store(u32::MAX, Ordering::SeqCst);

        let ticket = cluster.agent("a").create_file("notes.txt", 1024, 2).unwrap();
        let file_id = ticket.file_id().clone();
        let outcome = ticket.wait().await.unwrap();

        assert!(matches!(outcome, CreateOutcome::LocalOnly { .. }));
        assert_eq!(outcome.file_id(), &file_id);
        assert_eq!(cluster.transport.count("NotifyFileCreated"), 7);
        assert!(cluster.agent("a").store().contains(&file_id));
        assert!(cluster.coordinator.replication().list_files().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_from_forgotten_peer_re_registers() {
        // ARRANGE: agent never registered
        let launcher = Arc::new(AgentLauncher::default());
        let coordinator = Coordinator::new(CoordinatorConfig::default(), launcher);
        let transport = LocalTransport::new(coordinator.clone());
        let agent = PeerAgent::new(spec("a", 10), PeerConfig::default(), transport.clone());

        // ACT
        let outcome = agent.create_file("notes.txt", 64, 1).unwrap().wait().await.unwrap();

        // ASSERT
        assert!(matches!(outcome, CreateOutcome::Registered { .. }));
        assert_eq!(transport.count("Register"), 1);
        assert_eq!(transport.count("NotifyFileCreated"), 2);
        assert!(coordinator.registry().is_online(&PeerId::new("a")));
    }

    #[tokio::test]
    async fn test_create_rejected_when_storage_is_full() {
        let cluster = cluster(&[("a", 1)]).await;
        let agent = cluster.agent("a");

        let result = agent.create_file("huge.iso", 2 * 1024 * 1024 * 1024, 1);

        assert!(matches!(result, Err(ClusterError::Resource(_))));
        assert_eq!(agent.store().used(), 0);
        assert_eq!(cluster.transport.count("NotifyFileCreated"), 0);
    }

    #[tokio::test]
    async fn test_create_validates_name_and_replication_factor() {
        let cluster = cluster(&[("a", 1)]).await;
        let agent = cluster.agent("a");

        assert!(matches!(agent.create_file(" ", 10, 1), Err(ClusterError::Protocol(_))));
        assert!(matches!(agent.create_file("x", 10, 0), Err(ClusterError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_large_file_is_created_in_background() {
        // ARRANGE
        let cluster = cluster(&[("a", 1)]).await;
        let agent = cluster.agent("a");
        let mut events = agent.subscribe();
        let size = 12 * MIB;

        // ACT: admission is already accounted for when create returns
        let ticket = agent.create_file("video.mp4", size, 1).unwrap();
        assert_eq!(agent.store().used(), size);
        let file_id = ticket.file_id().clone();
        let outcome = ticket.wait().await.unwrap();

        // ASSERT
        assert_eq!(outcome, CreateOutcome::Registered { file_id: file_id.clone() });
        assert_eq!(agent.store().get(&file_id).unwrap().size(), size);
        assert_eq!(agent.store().used(), size);
        match events.recv().await.unwrap() {
            AgentEvent::FileCreated { file_id: created, size_bytes, .. } => {
                assert_eq!(created, file_id);
                assert_eq!(size_bytes, size);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    // ============================================================
    // TEST 3: Cluster flows
    // ============================================================

    #[tokio::test]
    async fn test_25mb_file_lands_on_exactly_one_other_peer() {
        // ARRANGE
        let cluster = cluster(&[("a", 10), ("b", 10), ("c", 10)]).await;
        let owner = cluster.agent("a");

        // ACT
        let ticket = owner.create_file("movie.mkv", 25_000_000, 2).unwrap();
        let file_id = ticket.file_id().clone();
        assert!(matches!(ticket.wait().await.unwrap(), CreateOutcome::Registered { .. }));
        wait_until(|| cluster.file_state(&file_id) == Some(ReplicationState::Satisfied)).await;

        // ASSERT
        let record = cluster.coordinator.replication().get(&file_id).unwrap();
        let receivers: Vec<&str> = ["b", "c"]
            .into_iter()
            .filter(|id| cluster.agent(id).store().contains(&file_id))
            .collect();
        assert_eq!(receivers.len(), 1);
        assert_eq!(
            record.holders,
            BTreeSet::from([PeerId::new("a"), PeerId::new(receivers[0])])
        );

        let original = owner.store().get(&file_id).unwrap();
        let copy = cluster.agent(receivers[0]).store().get(&file_id).unwrap();
        assert_eq!(copy.bytes, original.bytes);
        assert_eq!(copy.name, "movie.mkv");
        assert_eq!(plan_chunks(25_000_000).len(), 5);
        assert_eq!(owner.store().used(), 25_000_000);
    }

    #[tokio::test]
    async fn test_download_makes_requester_a_holder() {
        // ARRANGE
        let cluster = cluster(&[("a", 10), ("b", 10)]).await;
        let ticket = cluster.agent("a").create_file("report.pdf", 3 * MIB, 1).unwrap();
        let file_id = ticket.file_id().clone();
        ticket.wait().await.unwrap();
        let mut events = cluster.agent("b").subscribe();

        // ACT
        let written = cluster.agent("b").download(&file_id).await.unwrap();

        // ASSERT
        assert_eq!(written, 3 * MIB);
        assert_eq!(
            cluster.agent("b").store().get(&file_id).unwrap().bytes,
            cluster.agent("a").store().get(&file_id).unwrap().bytes
        );
        let record = cluster.coordinator.replication().get(&file_id).unwrap();
        assert_eq!(record.holders, BTreeSet::from([PeerId::new("a"), PeerId::new("b")]));
        let source = cluster.coordinator.registry().get(&PeerId::new("a")).unwrap();
        assert_eq!(source.active_transfers, 0);
        assert_eq!(cluster.transport.count("TransferComplete"), 1);

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            if let AgentEvent::TransferFinished { success, .. } = event {
                finished = success;
            }
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_download_of_unknown_file_is_not_found() {
        let cluster = cluster(&[("a", 10)]).await;

        let result = cluster.agent("a").download(&FileId("nope".into())).await;

        assert!(matches!(result, Err(ClusterError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replica_releases_reservation() {
        // ARRANGE: the named source has no store behind it
        let cluster = cluster(&[("a", 10)]).await;
        let agent = cluster.agent("a");
        let order = ReplicateOrder {
            file_id: FileId("f".into()),
            name: "f.bin".into(),
            size_bytes: 2 * MIB,
            source_peer_id: PeerId::new("ghost"),
            source_addr: "ghost.local:9000".into(),
            chunk_plan: plan_chunks(2 * MIB),
        };

        // ACT
        let result = agent.replicate(order).await;

        // ASSERT
        assert!(matches!(result, Err(ClusterError::Connection(_))));
        assert!(!agent.store().contains(&FileId("f".into())));
        assert_eq!(agent.store().used(), 0);
        assert_eq!(agent.available_slots(), 4);
    }

    #[tokio::test]
    async fn test_replica_order_for_held_file_is_noop() {
        let cluster = cluster(&[("a", 10)]).await;
        let agent = cluster.agent("a");
        let ticket = agent.create_file("held.bin", 4096, 1).unwrap();
        let file_id = ticket.file_id().clone();
        ticket.wait().await.unwrap();

        let result = agent
            .replicate(ReplicateOrder {
                file_id: file_id.clone(),
                name: "held.bin".into(),
                size_bytes: 4096,
                source_peer_id: PeerId::new("ghost"),
                source_addr: "ghost.local:9000".into(),
                chunk_plan: plan_chunks(4096),
            })
            .await;

        assert_eq!(result, Ok(4096));
        assert_eq!(agent.store().used(), 4096);
    }

    // ============================================================
    // TEST 4: Membership
    // ============================================================

    #[tokio::test]
    async fn test_heartbeat_to_forgetful_coordinator_re_registers() {
        // ARRANGE
        let launcher = Arc::new(AgentLauncher::default());
        let coordinator = Coordinator::new(CoordinatorConfig::default(), launcher);
        let transport = LocalTransport::new(coordinator.clone());
        let agent = PeerAgent::new(spec("a", 10), PeerConfig::default(), transport.clone());
        assert!(matches!(agent.send_heartbeat().await, Err(ClusterError::NotFound(_))));

        // ACT
        agent.clone().start().await;

        // ASSERT
        wait_until(|| coordinator.registry().is_online(&PeerId::new("a"))).await;
        assert_eq!(transport.count("Register"), 1);
    }

    #[tokio::test]
    async fn test_register_conflict_is_reported() {
        let cluster = cluster(&[("a", 10)]).await;
        let impostor = PeerAgent::new(spec("a", 99), PeerConfig::default(), cluster.transport.clone());

        let result = impostor.register().await;

        assert!(matches!(result, Err(ClusterError::Conflict(_))));
    }

    #[test]
    fn test_advertised_address_must_be_dialable() {
        let wildcard: std::net::SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let loopback: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();

        assert!(matches!(advertise_addr(wildcard, None), Err(ClusterError::Protocol(_))));
        assert!(matches!(advertise_addr(loopback, Some("  ")), Err(ClusterError::Protocol(_))));
        assert_eq!(
            advertise_addr(wildcard, Some("node-a.lan:9000")).unwrap(),
            "node-a.lan:9000"
        );
        assert_eq!(advertise_addr(loopback, None).unwrap(), "127.0.0.1:9000");
    }

    // ============================================================
    // TEST 5: Handlers
    // ============================================================

    #[tokio::test]
    async fn test_serve_chunk_and_missing_chunk_status() {
        let cluster = cluster(&[("a", 10)]).await;
        let agent = cluster.agent("a");
        let ticket = agent.create_file("small.bin", 1000, 1).unwrap();
        let file_id = ticket.file_id().clone();
        ticket.wait().await.unwrap();

        let bytes = agent.serve_chunk(&file_id, 0).unwrap();
        let frame = ChunkFrame::decode(&bytes).unwrap();
        frame.verify(&chunk_span(1000, 0).unwrap()).unwrap();

        let response = handle_fetch_chunk(
            Extension(agent.clone()),
            Json(FetchChunkRequest {
                file_id: FileId("missing".into()),
                sequence_index: 0,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_handler_defaults_replication_factor() {
        let cluster = cluster(&[("a", 10), ("b", 10)]).await;

        let (status, Json(body)) = handle_create(
            Extension(cluster.agent("a").clone()),
            Json(CreateFileRequest {
                name: "doc.txt".into(),
                size_bytes: 2048,
                replication_factor: None,
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.registered);
        let file_id = body.file_id.unwrap();
        let record = cluster.coordinator.replication().get(&file_id).unwrap();
        assert_eq!(record.replication_factor, 2);
        wait_until(|| cluster.file_state(&file_id) == Some(ReplicationState::Satisfied)).await;
        assert!(cluster.agent("b").store().contains(&file_id));
    }
}
