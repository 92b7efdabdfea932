//! Shared fixtures for cluster manager integration tests.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_cluster::{
    ClusterConfig, ClusterListener, ClusterManager, ClusterManagerOptions, Database,
    ListenerError, Node, StaticSampler,
};
use bulwark_gossip::{Gossiper, NodeId, NodeValue, StoreKey};
use bulwark_gossip_memory::{MemoryGossipNetwork, MemoryGossiper};
use bulwark_locks_memory::MemoryLockManager;
use bulwark_store_memory::MemoryStore;
use bytes::Bytes;
use parking_lot::Mutex;

pub const CLUSTER_ID: &str = "test-cluster";

pub type TestManager = ClusterManager<MemoryStore, MemoryLockManager, RecordingGossiper>;

pub fn ip(octet: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, octet))
}

/// Records every callback as `phase:node`.
#[derive(Default)]
pub struct RecordingListener {
    name: String,
    fail_on: Option<&'static str>,
    join_delay: Option<Duration>,
    add_delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }

    pub fn failing(name: &str, phase: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_on: Some(phase),
            ..Self::default()
        })
    }

    pub fn slow_join(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            join_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn slow_add(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            add_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls for one phase, as node ids.
    pub fn calls_for(&self, phase: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix(&format!("{phase}:")).map(str::to_string))
            .collect()
    }

    fn record(&self, phase: &'static str, node: &Node) -> Result<(), ListenerError> {
        self.calls.lock().push(format!("{phase}:{}", node.id));
        if self.fail_on == Some(phase) {
            return Err(format!("{} refuses {phase}", self.name).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cluster_init(&self, node: &Node, _: &Database) -> Result<(), ListenerError> {
        self.record("cluster_init", node)
    }

    async fn init(&self, node: &Node, _: &Database) -> Result<(), ListenerError> {
        self.record("init", node)
    }

    async fn join(&self, node: &Node, _: &Database) -> Result<(), ListenerError> {
        if let Some(delay) = self.join_delay {
            tokio::time::sleep(delay).await;
        }
        self.record("join", node)
    }

    async fn add(&self, node: &Node) -> Result<(), ListenerError> {
        if let Some(delay) = self.add_delay {
            tokio::time::sleep(delay).await;
        }
        self.record("add", node)
    }

    async fn update(&self, node: &Node) -> Result<(), ListenerError> {
        self.record("update", node)
    }

    async fn remove(&self, node: &Node) -> Result<(), ListenerError> {
        self.record("remove", node)
    }

    async fn leave(&self, node: &Node) -> Result<(), ListenerError> {
        self.record("leave", node)
    }
}

/// A memory gossiper that remembers which peers it was asked to add.
#[derive(Debug)]
pub struct RecordingGossiper {
    pub inner: MemoryGossiper,
    added: Mutex<Vec<SocketAddr>>,
}

impl RecordingGossiper {
    pub fn added(&self) -> Vec<SocketAddr> {
        self.added.lock().clone()
    }
}

#[async_trait]
impl Gossiper for RecordingGossiper {
    type Error = bulwark_gossip_memory::Error;

    fn node_id(&self) -> &NodeId {
        self.inner.node_id()
    }

    fn set_gossip_interval(&self, interval: Duration) {
        self.inner.set_gossip_interval(interval);
    }

    async fn add_node(&self, addr: SocketAddr) -> Result<(), Self::Error> {
        self.added.lock().push(addr);
        self.inner.add_node(addr).await
    }

    async fn remove_node(&self, addr: SocketAddr) -> Result<(), Self::Error> {
        self.inner.remove_node(addr).await
    }

    async fn update_self(&self, key: StoreKey, value: Bytes) {
        self.inner.update_self(key, value).await;
    }

    async fn get_store_key_value(&self, key: &StoreKey) -> Vec<NodeValue> {
        self.inner.get_store_key_value(key).await
    }

    async fn start(&self) -> Result<(), Self::Error> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), Self::Error> {
        self.inner.stop().await
    }
}

/// Backends shared by every simulated node in a test.
#[derive(Clone)]
pub struct Harness {
    pub network: MemoryGossipNetwork,
    pub store: MemoryStore,
    pub locks: MemoryLockManager,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            network: MemoryGossipNetwork::new(),
            store: MemoryStore::new(),
            locks: MemoryLockManager::new(),
        }
    }

    /// Heartbeats and gossip rounds only run when a test drives them.
    pub fn config(node_id: &str, octet: u8) -> ClusterConfig {
        let mut config = ClusterConfig::new(CLUSTER_ID, node_id);
        config.advertise_ip = Some(ip(octet));
        config.heartbeat_interval = Duration::from_secs(3600);
        config.gossip_interval = Duration::from_secs(60);
        config
    }

    pub fn manager(&self, node_id: &str, octet: u8) -> TestManager {
        self.manager_with(Self::config(node_id, octet))
    }

    pub fn manager_with(&self, config: ClusterConfig) -> TestManager {
        let addr = config.gossip_addr(config.advertise_ip.unwrap_or_else(|| ip(1)));
        let gossip = RecordingGossiper {
            inner: self.network.gossiper(addr, config.node_id.clone()),
            added: Mutex::new(Vec::new()),
        };

        ClusterManager::new(ClusterManagerOptions {
            locks: self.locks.with_holder(config.node_id.clone()),
            config,
            store: self.store.clone(),
            gossip: Arc::new(gossip),
            sampler: Arc::new(StaticSampler::default()),
        })
    }
}

/// Runs heartbeats and gossip rounds until every pair of running managers
/// has seen each other.
pub async fn converge(managers: &[&TestManager]) {
    for _ in 0..2 {
        for manager in managers {
            manager.heartbeat_now().await.unwrap();
        }
        for manager in managers {
            manager.gossip().inner.round();
        }
    }

    for manager in managers {
        manager.heartbeat_now().await.unwrap();
    }
}
