use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use storage_cluster::config::{CoordinatorConfig, PeerConfig};
use storage_cluster::coordinator::service::Coordinator;
use storage_cluster::events::log_events;
use storage_cluster::peer::agent::{PeerAgent, PeerSpec, advertise_addr};
use storage_cluster::peer::client::{HttpReplicaLauncher, HttpTransport};
use storage_cluster::types::PeerId;

#[derive(Parser)]
#[command(name = "storage_cluster", about = "Replicated storage cluster node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central coordinator.
    Coordinator {
        #[arg(long, default_value = "127.0.0.1:7000")]
        bind: SocketAddr,
    },
    /// Run a storage peer.
    Peer {
        #[arg(long)]
        peer_id: String,
        #[arg(long)]
        cpu: u32,
        /// Memory in GB.
        #[arg(long)]
        memory: u32,
        /// Storage capacity in GB.
        #[arg(long)]
        storage: u64,
        /// Bandwidth in Mbit/s.
        #[arg(long)]
        bandwidth: u64,
        #[arg(long)]
        bind: SocketAddr,
        /// Address other peers dial (`host:port`). Defaults to `--bind`.
        #[arg(long)]
        advertise: Option<String>,
        /// Coordinator address (`host:port`).
        #[arg(long, default_value = "127.0.0.1:7000")]
        coordinator: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    match Cli::parse().command {
        Command::Coordinator { bind } => run_coordinator(bind).await,
        Command::Peer {
            peer_id,
            cpu,
            memory,
            storage,
            bandwidth,
            bind,
            advertise,
            coordinator,
        } => {
            let spec = PeerSpec {
                peer_id: PeerId::new(peer_id),
                addr: advertise_addr(bind, advertise.as_deref())?,
                cpu,
                memory_gb: memory,
                storage_gb: storage,
                bandwidth_mbps: bandwidth,
            };
            run_peer(spec, bind, &coordinator).await
        }
    }
}

async fn run_coordinator(bind: SocketAddr) -> anyhow::Result<()> {
    let config = CoordinatorConfig::from_env();
    let coordinator = Coordinator::new(config, Arc::new(HttpReplicaLauncher::new()));

    // 1. Detector sweep + repair cycle:
    coordinator.clone().start().await;

    // 2. Peer status log:
    tokio::spawn(log_events(coordinator.subscribe(), "Peer", tracing::Level::INFO));

    // 3. HTTP server:
    let app = storage_cluster::coordinator::handlers::router(coordinator);
    tracing::info!("Coordinator listening on {}", bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_peer(spec: PeerSpec, bind: SocketAddr, coordinator: &str) -> anyhow::Result<()> {
    let config = PeerConfig::from_env();
    let transport = Arc::new(HttpTransport::new(coordinator, config.transfer.chunk_timeout));
    let agent = PeerAgent::new(spec, config, transport);

    // 1. Data plane first, so replica orders can land right after registering:
    let app = storage_cluster::peer::handlers::router(agent.clone());
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;

    // 2. Registration (fatal on failure):
    agent
        .register()
        .await
        .with_context(|| format!("registering {} with {}", agent.peer_id(), coordinator))?;

    // 3. Heartbeats:
    agent.clone().start().await;

    // 4. Progress log:
    tokio::spawn(log_events(agent.subscribe(), "Agent", tracing::Level::DEBUG));

    tracing::info!("Peer {} listening on {}", agent.peer_id(), bind);
    axum::serve(listener, app).await?;
    Ok(())
}
