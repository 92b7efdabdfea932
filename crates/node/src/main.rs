//! Runs a local bulwark cluster: several cluster managers in one process,
//! sharing in-memory store, lock and gossip backends.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_cluster::{
    ClusterConfig, ClusterError, ClusterListener, ClusterManager, ClusterManagerOptions, Database,
    ListenerError, Node, ProcSampler,
};
use bulwark_gossip_memory::{MemoryGossipNetwork, MemoryGossiper};
use bulwark_locks_memory::MemoryLockManager;
use bulwark_store_memory::MemoryStore;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type LocalManager = ClusterManager<MemoryStore, MemoryLockManager, MemoryGossiper>;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cluster manager failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Bad command line.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Cluster id shared by every node
    #[arg(long, default_value = "bulwark-local", env = "BULWARK_CLUSTER_ID")]
    cluster_id: String,

    /// Gossip interval in milliseconds
    #[arg(long, default_value_t = 2000, env = "BULWARK_GOSSIP_INTERVAL_MS")]
    gossip_interval_ms: u64,

    /// Gossip port (nodes bind 127.0.0.N on this port)
    #[arg(long, default_value_t = 9002, env = "BULWARK_GOSSIP_PORT")]
    gossip_port: u16,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 2000, env = "BULWARK_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: u64,

    /// Cluster lock lease in seconds
    #[arg(long, default_value_t = 60, env = "BULWARK_LOCK_LEASE_SECS")]
    lock_lease_secs: u64,

    /// Log filter directive
    #[arg(long, default_value = "info", env = "BULWARK_LOG")]
    log: String,

    /// Number of nodes to run
    #[arg(long, default_value_t = 3, env = "BULWARK_NODES")]
    nodes: u8,

    /// Seconds between membership reports
    #[arg(long, default_value_t = 10, env = "BULWARK_REPORT_INTERVAL_SECS")]
    report_interval_secs: u64,
}

/// Logs every membership event a node sees.
struct LoggingListener {
    name: String,
}

#[async_trait]
impl ClusterListener for LoggingListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cluster_init(&self, node: &Node, _db: &Database) -> Result<(), ListenerError> {
        info!(listener = %self.name, node = %node.id, "created cluster");
        Ok(())
    }

    async fn join(&self, node: &Node, db: &Database) -> Result<(), ListenerError> {
        info!(
            listener = %self.name,
            node = %node.id,
            known = db.node_entries.len(),
            "joined cluster"
        );
        Ok(())
    }

    async fn add(&self, node: &Node) -> Result<(), ListenerError> {
        info!(listener = %self.name, peer = %node.id, ip = %node.ip, "peer added");
        Ok(())
    }

    async fn update(&self, node: &Node) -> Result<(), ListenerError> {
        warn!(listener = %self.name, peer = %node.id, status = %node.status, "peer updated");
        Ok(())
    }

    async fn leave(&self, node: &Node) -> Result<(), ListenerError> {
        info!(listener = %self.name, node = %node.id, "leaving cluster");
        Ok(())
    }
}

fn node_config(args: &Args, index: u8) -> ClusterConfig {
    let mut config = ClusterConfig::new(args.cluster_id.clone(), format!("node-{index}"));
    config.advertise_ip = Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, index)));
    config.gossip_port = args.gossip_port;
    config.heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
    config.gossip_interval = Duration::from_millis(args.gossip_interval_ms);
    config.lock_lease = Duration::from_secs(args.lock_lease_secs);
    config
}

fn spawn_signal_handler(shutdown_token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                _ => {
                    error!("unable to install signal handlers, falling back to ctrl-c");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        info!("Shutting down");
        shutdown_token.cancel();
    });
}

async fn report(managers: Arc<Vec<LocalManager>>, every: Duration, shutdown_token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for manager in managers.iter() {
                    let cluster = manager.enumerate().await;
                    let members: Vec<&str> = cluster.nodes.iter().map(|n| n.id.as_str()).collect();
                    info!(
                        node = %manager.config().node_id,
                        cluster = %cluster.id,
                        status = ?cluster.status,
                        ?members,
                        "membership"
                    );
                }
            }
            () = shutdown_token.cancelled() => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.nodes == 0 || args.nodes == u8::MAX {
        return Err(Error::InvalidArgument(format!(
            "--nodes must be between 1 and {}",
            u8::MAX - 1
        )));
    }

    let network = MemoryGossipNetwork::new();
    let store = MemoryStore::new();
    let locks = MemoryLockManager::new();

    let shutdown_token = CancellationToken::new();
    spawn_signal_handler(shutdown_token.clone());

    let mut managers: Vec<LocalManager> = Vec::with_capacity(usize::from(args.nodes));
    for index in 1..=args.nodes {
        let config = node_config(&args, index);
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, index));
        let gossip = network.gossiper(config.gossip_addr(ip), config.node_id.clone());

        let manager = ClusterManager::new(ClusterManagerOptions {
            locks: locks.with_holder(config.node_id.clone()),
            config,
            store: store.clone(),
            gossip: Arc::new(gossip),
            sampler: Arc::new(ProcSampler::new()),
        });
        manager.add_event_listener(Arc::new(LoggingListener {
            name: format!("log-{index}"),
        }));

        if let Err(e) = manager.start().await {
            error!(node = index, "unable to start cluster manager: {}", e);
            for started in managers.iter().rev() {
                if let Err(e) = started.shutdown().await {
                    warn!("error during shutdown: {}", e);
                }
            }
            return Err(e.into());
        }

        managers.push(manager);
    }

    info!(nodes = managers.len(), "local cluster running");

    let managers = Arc::new(managers);
    let reporter = tokio::spawn(report(
        Arc::clone(&managers),
        Duration::from_secs(args.report_interval_secs.max(1)),
        shutdown_token.clone(),
    ));

    shutdown_token.cancelled().await;

    if let Err(e) = reporter.await {
        warn!("membership reporter failed: {}", e);
    }

    for manager in managers.iter().rev() {
        if let Err(e) = manager.shutdown().await {
            warn!(node = %manager.config().node_id, "error during shutdown: {}", e);
        }
        manager.wait().await;
    }

    info!("local cluster stopped");
    Ok(())
}
