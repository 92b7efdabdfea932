//! Node: one cluster member's observed state, and the `Cluster` snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::{ClusterStatus, NodeEntry};

/// Health of a node as reported by the node itself or inferred by peers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet part of the cluster.
    #[default]
    Init,

    /// Healthy.
    Ok,

    /// Stopped heartbeating; set by peers when gossip marks the node down.
    Offline,

    /// Reachable but reporting itself unhealthy.
    Error,
}

impl NodeStatus {
    /// Returns `true` for [`NodeStatus::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Ok => write!(f, "ok"),
            Self::Offline => write!(f, "offline"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Memory usage in bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Total physical memory.
    pub total: u64,

    /// Memory in use.
    pub used: u64,

    /// Memory available for new allocations.
    pub free: u64,
}

/// A block device exported to this node.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Lun {
    /// Device path, e.g. `/dev/sdb`.
    pub device_path: String,

    /// Capacity in bytes.
    pub size_bytes: u64,
}

/// A container running on this node.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Runtime-assigned id.
    pub id: String,

    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Runtime state, e.g. `running`.
    pub state: String,
}

/// Resources sampled locally by the owning node.
///
/// Peers only ever receive this through gossip; nobody computes it for
/// another node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU usage in percent across all cores.
    pub cpu: f64,

    /// Memory usage.
    pub memory: MemoryUsage,

    /// Attached LUNs keyed by device path.
    pub luns: BTreeMap<String, Lun>,

    /// Containers known to the local runtime.
    pub containers: Vec<Container>,
}

/// Value stored in a node's advertised `node_data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum NodeDataValue {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Ordered list.
    List(Vec<NodeDataValue>),
    /// String-keyed map.
    Map(BTreeMap<String, NodeDataValue>),
}

impl From<bool> for NodeDataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for NodeDataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for NodeDataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for NodeDataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for NodeDataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for NodeDataValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// One cluster member's observed state.
///
/// `id` never changes for the lifetime of a process. Everything else is
/// refreshed by the owning node on every heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier.
    pub id: String,

    /// Address peers reach this node on.
    pub ip: IpAddr,

    /// Health.
    pub status: NodeStatus,

    /// Last refresh by the owning node.
    pub timestamp: DateTime<Utc>,

    /// Locally sampled resources.
    pub resources: ResourceSnapshot,

    /// Subsystem metadata advertised by the owning node.
    pub node_data: BTreeMap<String, NodeDataValue>,
}

impl Node {
    /// Creates a node in `Init` status with an unspecified address.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            status: NodeStatus::Init,
            timestamp: Utc::now(),
            resources: ResourceSnapshot::default(),
            node_data: BTreeMap::new(),
        }
    }

    /// The durable registry record for this node.
    #[must_use]
    pub fn entry(&self) -> NodeEntry {
        NodeEntry {
            id: self.id.clone(),
            ip: self.ip,
        }
    }
}

/// Point-in-time view of the cluster built from the node cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster id.
    pub id: String,

    /// Cluster status as last seen in the database.
    pub status: ClusterStatus,

    /// Live nodes ordered by id.
    pub nodes: Vec<Node>,
}
