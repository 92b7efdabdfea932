//! The cluster manager: startup state machine, heartbeat task and the read
//! API exposed to subsystems.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bulwark_gossip::Gossiper;
use bulwark_locks::{LockGuard, LockManager, LockManager1, LockManagerError};
use bulwark_store::Store1;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ClusterConfig;
use crate::database::{ClusterStatus, Database, LOCK_KEY, read_database, write_database};
use crate::error::ClusterError;
use crate::heartbeat::{Heartbeat, NodeCache};
use crate::listener::{ClusterListener, Listeners, MembershipPhase, StartupPhase};
use crate::node::{Cluster, Node, NodeDataValue, NodeStatus};
use crate::sampler::{ResourceSampler, detect_external_ip};

/// How long shutdown waits for the heartbeat task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the manager is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManagerState {
    /// Constructed, not started.
    Uninitialized,

    /// Startup found an `Init` database and is creating the cluster.
    NewCluster,

    /// Startup found an `Ok` database and is joining it.
    ExistingCluster,

    /// Startup finished; heartbeats are running.
    Running,

    /// Shut down.
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::NewCluster => write!(f, "new cluster"),
            Self::ExistingCluster => write!(f, "existing cluster"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct HeartbeatTask {
    shutdown: CancellationToken,
    exited: CancellationToken,
    handle: JoinHandle<()>,
}

/// Options for creating a [`ClusterManager`].
pub struct ClusterManagerOptions<S, L, G> {
    /// Identity and timings.
    pub config: ClusterConfig,

    /// Cluster-wide key-value store (scoped to the cluster id by the manager).
    pub store: S,

    /// Cluster-wide lock manager (scoped to the cluster id by the manager).
    pub locks: L,

    /// This node's gossip participant.
    pub gossip: Arc<G>,

    /// Resource sampler for the self node.
    pub sampler: Arc<dyn ResourceSampler>,
}

/// Tracks cluster membership for one node.
pub struct ClusterManager<S, L, G>
where
    S: Store1,
    L: LockManager1,
    G: Gossiper,
{
    config: ClusterConfig,
    store: S::Scoped,
    locks: L::Scoped,
    heartbeat: Arc<Heartbeat<G>>,
    status: SyncRwLock<ClusterStatus>,
    state: SyncRwLock<ManagerState>,
    task: Mutex<Option<HeartbeatTask>>,
}

impl<S, L, G> ClusterManager<S, L, G>
where
    S: Store1,
    L: LockManager1,
    G: Gossiper,
{
    /// Creates a manager. Nothing touches the store or the network until [`Self::start`].
    pub fn new(
        ClusterManagerOptions {
            config,
            store,
            locks,
            gossip,
            sampler,
        }: ClusterManagerOptions<S, L, G>,
    ) -> Self {
        let mut self_node = Node::new(config.node_id.clone());
        if let Some(ip) = config.advertise_ip {
            self_node.ip = ip;
        }

        let heartbeat = Heartbeat {
            gossip,
            sampler,
            listeners: Arc::new(Listeners::default()),
            self_node: Arc::new(SyncRwLock::new(self_node)),
            cache: Arc::new(RwLock::new(NodeCache::new())),
            updates_enabled: Arc::new(AtomicBool::new(true)),
            key: config.heartbeat_key(),
        };

        Self {
            store: store.scope(&config.cluster_id),
            locks: locks.scope(&config.cluster_id),
            config,
            heartbeat: Arc::new(heartbeat),
            status: SyncRwLock::new(ClusterStatus::Init),
            state: SyncRwLock::new(ManagerState::Uninitialized),
            task: Mutex::new(None),
        }
    }

    /// The configuration this manager was built with.
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    fn set_state(&self, state: ManagerState) {
        debug!(node = %self.config.node_id, %state, "cluster manager state change");
        *self.state.write() = state;
    }

    /// A copy of this node's own record.
    pub fn self_node(&self) -> Node {
        self.heartbeat.self_node.read().clone()
    }

    /// The gossip participant this manager drives.
    pub fn gossip(&self) -> &Arc<G> {
        &self.heartbeat.gossip
    }

    /// Registers a listener. Listeners are called in registration order.
    pub fn add_event_listener(&self, listener: Arc<dyn ClusterListener>) {
        info!(listener = listener.name(), "adding cluster event listener");
        self.heartbeat.listeners.register(listener);
    }

    /// Stops fanning membership changes out to listeners. The cache is still updated.
    pub fn disable_gossip_updates(&self) {
        warn!("disabling gossip updates");
        self.heartbeat.updates_enabled.store(false, Ordering::SeqCst);
    }

    /// Resumes fanning membership changes out to listeners.
    pub fn enable_gossip_updates(&self) {
        warn!("enabling gossip updates");
        self.heartbeat.updates_enabled.store(true, Ordering::SeqCst);
    }

    /// Whether listeners receive `add`/`update` from the heartbeat loop.
    pub fn gossip_updates_enabled(&self) -> bool {
        self.heartbeat.updates_enabled.load(Ordering::SeqCst)
    }

    /// Sets a key in this node's advertised data. Peers see it after the next heartbeat.
    pub fn update_node_data<K, V>(&self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<NodeDataValue>,
    {
        self.heartbeat
            .self_node
            .write()
            .node_data
            .insert(key.into(), value.into());
    }

    /// Looks up a live node by id.
    pub async fn locate_node(&self, id: &str) -> Result<Node, ClusterError> {
        self.heartbeat
            .cache
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(id.to_string()))
    }

    /// Every live node keyed by id.
    pub async fn get_cluster_node_data(&self) -> HashMap<String, Node> {
        self.heartbeat.cache.read().await.clone()
    }

    /// A snapshot of the cluster, nodes ordered by id.
    pub async fn enumerate(&self) -> Cluster {
        let mut nodes: Vec<Node> = self.heartbeat.cache.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        Cluster {
            id: self.config.cluster_id.clone(),
            status: *self.status.read(),
            nodes,
        }
    }

    /// Joins (or creates) the cluster, then starts gossip and the heartbeat task.
    ///
    /// Returns as soon as the heartbeat task is spawned. Every error is fatal:
    /// the node must not serve without having joined.
    #[instrument(skip(self), fields(cluster = %self.config.cluster_id, node = %self.config.node_id))]
    pub async fn start(&self) -> Result<(), ClusterError> {
        let mut task = self.task.lock().await;
        if self.state() != ManagerState::Uninitialized {
            return Err(ClusterError::AlreadyStarted);
        }

        info!("cluster manager starting");

        self.heartbeat
            .gossip
            .set_gossip_interval(self.config.gossip_interval);

        let ip = match self.config.advertise_ip {
            Some(ip) => ip,
            None => detect_external_ip().await?,
        };
        {
            let mut self_node = self.heartbeat.self_node.write();
            self_node.ip = ip;
            self_node.status = NodeStatus::Ok;
        }

        let guard = self
            .locks
            .lock(LOCK_KEY.to_string(), self.config.lock_lease)
            .await
            .map_err(|e| ClusterError::Lock(e.to_string()))?;

        let database = match self.initialize_locked().await {
            Ok(database) => database,
            Err(e) => {
                error!("failed to join the cluster: {}", e);
                if let Err(unlock) = guard.release().await {
                    warn!("unable to release cluster lock after failed startup: {}", unlock);
                }
                return Err(e);
            }
        };

        if let Err(e) = write_database(&self.store, &database).await {
            error!("failed to save the cluster database: {}", e);
            if let Err(unlock) = guard.release().await {
                warn!("unable to release cluster lock after failed write: {}", unlock);
            }
            return Err(e);
        }

        guard.release().await.map_err(|e| {
            if e.is_lease_expired() {
                error!(lease = ?self.config.lock_lease, "startup outlived the cluster lock lease");
            }
            ClusterError::Unlock(e.to_string())
        })?;

        *self.status.write() = database.status;
        self.heartbeat.refresh_self().await;

        self.heartbeat
            .gossip
            .start()
            .await
            .map_err(|e| ClusterError::Gossip(e.to_string()))?;

        *task = Some(self.spawn_heartbeat());
        self.set_state(ManagerState::Running);

        info!(ip = %ip, "cluster manager started");
        Ok(())
    }

    /// Read-decide-mutate part of startup. Must run under the cluster lock.
    async fn initialize_locked(&self) -> Result<Database, ClusterError> {
        let mut database = read_database(&self.store).await?;
        let self_node = self.heartbeat.sample_self().await;

        match database.status {
            ClusterStatus::Init => {
                info!("will initialize a new cluster");
                self.set_state(ManagerState::NewCluster);

                database.status = ClusterStatus::Ok;
                database.register(self_node.entry());
                self.log_joining(&self_node);

                self.heartbeat
                    .listeners
                    .dispatch_startup(StartupPhase::ClusterInit, &self_node, &database)
                    .await?;
                self.join_cluster(&database, &self_node, false).await?;
            }
            ClusterStatus::Ok => {
                info!("cluster state is OK, joining the cluster");
                self.set_state(ManagerState::ExistingCluster);

                let existed = database.register(self_node.entry());
                self.log_joining(&self_node);

                self.join_cluster(&database, &self_node, existed).await?;
            }
            status => {
                error!(?status, "cluster is in an unexpected state");
                return Err(ClusterError::UnexpectedState(status));
            }
        }

        Ok(database)
    }

    fn log_joining(&self, self_node: &Node) {
        info!(
            cluster = %self.config.cluster_id,
            ip = %self_node.ip,
            "node {} joining cluster",
            self_node.id
        );
    }

    /// Runs `init` (first join only) and `join` on every listener, then peers
    /// gossip with every other registered node.
    async fn join_cluster(
        &self,
        database: &Database,
        self_node: &Node,
        existed: bool,
    ) -> Result<(), ClusterError> {
        let listeners = &self.heartbeat.listeners;

        if !existed {
            listeners
                .dispatch_startup(StartupPhase::Init, self_node, database)
                .await?;
        }

        listeners
            .dispatch_startup(StartupPhase::Join, self_node, database)
            .await?;

        for (id, entry) in &database.node_entries {
            if *id == self_node.id {
                continue;
            }

            // Same address as ours: a stale registration, never gossip with it.
            if entry.ip == self_node.ip {
                warn!(
                    peer = %id,
                    ip = %entry.ip,
                    "detected node with our IP in the database, will not connect to it"
                );
                continue;
            }

            let addr = self.config.gossip_addr(entry.ip);
            info!(peer = %id, %addr, "connecting to node");

            if let Err(e) = self.heartbeat.gossip.add_node(addr).await {
                warn!(peer = %id, %addr, "unable to add gossip peer: {}", e);
            }
        }

        Ok(())
    }

    fn spawn_heartbeat(&self) -> HeartbeatTask {
        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();
        let heartbeat = Arc::clone(&self.heartbeat);
        let interval = self.config.heartbeat_interval;
        let token = shutdown.clone();
        let exit_guard = exited.clone().drop_guard();

        let handle = tokio::spawn(async move {
            let _exit_guard = exit_guard;
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            () = token.cancelled() => break,
                            () = heartbeat.tick() => {}
                        }
                    }
                }
            }

            info!("heartbeat task received shutdown signal");
            debug!("heartbeat task exiting");
        });

        HeartbeatTask {
            shutdown,
            exited,
            handle,
        }
    }

    /// Runs one heartbeat immediately, outside the background schedule.
    pub async fn heartbeat_now(&self) -> Result<(), ClusterError> {
        if self.state() != ManagerState::Running {
            return Err(ClusterError::NotRunning);
        }

        self.heartbeat.tick().await;
        Ok(())
    }

    /// Drops peers from the local view and tells listeners. The database is untouched.
    ///
    /// Returns how many of `nodes` were cached. This node itself is never removed.
    pub async fn remove(&self, nodes: &[Node]) -> Result<usize, ClusterError> {
        if self.state() != ManagerState::Running {
            return Err(ClusterError::NotRunning);
        }

        let mut removed = 0;

        for node in nodes {
            if node.id == self.config.node_id {
                warn!("refusing to remove self from the cluster view");
                continue;
            }

            let cached = self.heartbeat.cache.write().await.remove(&node.id);
            match cached {
                Some(cached) => {
                    info!(peer = %cached.id, "removing node from cluster view");
                    self.heartbeat
                        .listeners
                        .notify(MembershipPhase::Remove, &cached)
                        .await;
                    removed += 1;
                }
                None => debug!(peer = %node.id, "node not cached, nothing to remove"),
            }
        }

        Ok(removed)
    }

    /// Stops the heartbeat task, tells listeners this node is leaving and
    /// stops gossip. Safe to call more than once.
    #[instrument(skip(self), fields(cluster = %self.config.cluster_id, node = %self.config.node_id))]
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        let mut task = self.task.lock().await;

        match self.state() {
            ManagerState::Stopped => return Ok(()),
            ManagerState::Running => {}
            _ => {
                self.set_state(ManagerState::Stopped);
                return Ok(());
            }
        }

        info!("shutting down cluster manager");

        if let Some(HeartbeatTask {
            shutdown, handle, ..
        }) = task.take()
        {
            shutdown.cancel();
            let abort = handle.abort_handle();

            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("heartbeat task shut down cleanly"),
                Ok(Err(e)) => error!("heartbeat task panicked: {}", e),
                Err(_) => {
                    error!("heartbeat task did not shut down within timeout, aborting");
                    abort.abort();
                }
            }
        }

        let mut self_node = self.self_node();
        self_node.status = NodeStatus::Offline;
        self.heartbeat
            .listeners
            .notify(MembershipPhase::Leave, &self_node)
            .await;

        let stopped = self.heartbeat.gossip.stop().await;

        self.heartbeat.cache.write().await.clear();
        self.set_state(ManagerState::Stopped);

        stopped.map_err(|e| ClusterError::Gossip(e.to_string()))?;

        info!("cluster manager shutdown complete");
        Ok(())
    }

    /// Resolves when the heartbeat task has exited (after shutdown, or if it panicked).
    ///
    /// Resolves immediately if the manager never started.
    pub async fn wait(&self) {
        let exited = self
            .task
            .lock()
            .await
            .as_ref()
            .map(|task| task.exited.clone());

        if let Some(exited) = exited {
            exited.cancelled().await;
        }
    }
}

impl<S, L, G> fmt::Debug for ClusterManager<S, L, G>
where
    S: Store1,
    L: LockManager1,
    G: Gossiper,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("listeners", &self.heartbeat.listeners)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use assert_matches::assert_matches;
    use bulwark_gossip_memory::{MemoryGossipNetwork, MemoryGossiper};
    use bulwark_locks_memory::MemoryLockManager;
    use bulwark_store_memory::MemoryStore;

    use crate::sampler::StaticSampler;

    type TestManager = ClusterManager<MemoryStore, MemoryLockManager, MemoryGossiper>;

    fn manager(network: &MemoryGossipNetwork, store: &MemoryStore, octet: u8) -> TestManager {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, octet));
        let mut config = ClusterConfig::new("unit", format!("node-{octet}"));
        config.advertise_ip = Some(ip);
        config.heartbeat_interval = Duration::from_millis(50);

        let gossip = network.gossiper(config.gossip_addr(ip), config.node_id.clone());

        ClusterManager::new(ClusterManagerOptions {
            config,
            store: store.clone(),
            locks: MemoryLockManager::new(),
            gossip: Arc::new(gossip),
            sampler: Arc::new(StaticSampler::default()),
        })
    }

    #[tokio::test]
    async fn test_running_only_operations_before_start() {
        let manager = manager(&MemoryGossipNetwork::new(), &MemoryStore::new(), 1);

        assert_eq!(manager.state(), ManagerState::Uninitialized);
        assert_matches!(manager.heartbeat_now().await, Err(ClusterError::NotRunning));
        assert_matches!(manager.remove(&[]).await, Err(ClusterError::NotRunning));
        assert_matches!(
            manager.locate_node("node-1").await,
            Err(ClusterError::NodeNotFound(id)) if id == "node-1"
        );

        // Never started: wait returns at once, shutdown just marks it stopped.
        manager.wait().await;
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let manager = manager(&MemoryGossipNetwork::new(), &MemoryStore::new(), 1);

        manager.start().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Running);
        assert_matches!(manager.start().await, Err(ClusterError::AlreadyStarted));

        manager.shutdown().await.unwrap();
        manager.wait().await;
        assert_matches!(manager.start().await, Err(ClusterError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_node_data_is_advertised() {
        let manager = manager(&MemoryGossipNetwork::new(), &MemoryStore::new(), 1);

        manager.update_node_data("zone", "eu-west");
        manager.update_node_data("weight", 3_i64);
        manager.start().await.unwrap();

        let me = manager.locate_node("node-1").await.unwrap();
        assert_eq!(me.status, NodeStatus::Ok);
        assert_eq!(me.node_data["zone"], NodeDataValue::from("eu-west"));
        assert_eq!(me.node_data["weight"], NodeDataValue::Integer(3));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_gossip_update_toggle() {
        let manager = manager(&MemoryGossipNetwork::new(), &MemoryStore::new(), 1);

        assert!(manager.gossip_updates_enabled());
        manager.disable_gossip_updates();
        assert!(!manager.gossip_updates_enabled());
        manager.enable_gossip_updates();
        assert!(manager.gossip_updates_enabled());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ManagerState::ExistingCluster.to_string(), "existing cluster");
        assert_eq!(ManagerState::Running.to_string(), "running");
    }
}
