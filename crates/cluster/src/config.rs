//! Cluster manager configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bulwark_gossip::StoreKey;

/// Default port gossip peers listen on.
pub const DEFAULT_GOSSIP_PORT: u16 = 9002;

/// Default period of the heartbeat loop.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Default period between gossip rounds.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(2);

/// Default lease on the cluster lock during startup.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(60);

const HEARTBEAT_KEY_PREFIX: &str = "heartbeat";

/// Configuration for the cluster manager
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Cluster this node belongs to. Scopes the store, the lock and gossip keys.
    pub cluster_id: String,

    /// This node's id. Must be stable across restarts.
    pub node_id: String,

    /// Address advertised to peers. Detected from the routing table when unset.
    pub advertise_ip: Option<IpAddr>,

    /// Port peers gossip on.
    pub gossip_port: u16,

    /// Period of the heartbeat loop.
    pub heartbeat_interval: Duration,

    /// Period between gossip rounds.
    pub gossip_interval: Duration,

    /// Lease on the cluster lock. Not renewed; startup must finish within it.
    pub lock_lease: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            node_id: "node-0".to_string(),
            advertise_ip: None,
            gossip_port: DEFAULT_GOSSIP_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }
}

impl ClusterConfig {
    /// Creates a configuration with default timings.
    pub fn new<C: Into<String>, N: Into<String>>(cluster_id: C, node_id: N) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Gossip key heartbeats for this cluster are published under.
    #[must_use]
    pub fn heartbeat_key(&self) -> StoreKey {
        StoreKey::new(format!("{HEARTBEAT_KEY_PREFIX}{}", self.cluster_id))
    }

    /// Gossip address of a node reachable on `ip`.
    #[must_use]
    pub const fn gossip_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.gossip_port)
    }
}
