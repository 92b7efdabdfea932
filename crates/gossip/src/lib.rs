//! Abstract interface for the peer directory: a gossip layer that spreads
//! small per-node records and classifies each peer as up or down.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identifier of a gossip participant.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Key under which records are gossiped.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct StoreKey(String);

impl StoreKey {
    /// Creates a store key.
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness of a peer as judged by the gossip layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// A fresh record arrived within the death threshold.
    Up,

    /// No fresh record arrived within the death threshold.
    Down,
}

/// One node's record for a key, as currently known locally.
#[derive(Clone, Debug)]
pub struct NodeValue {
    /// The node that published the record.
    pub id: NodeId,

    /// Opaque payload published by that node.
    pub value: Bytes,

    /// Publisher-assigned version, strictly increasing per node.
    pub version: u64,

    /// Local instant at which this version was learned.
    pub last_update: Instant,

    /// Liveness classification.
    pub status: PeerStatus,
}

/// Marker trait for `Gossiper` errors
pub trait GossipError: Debug + Error + Send + Sync + 'static {}

/// A gossip participant.
#[async_trait]
pub trait Gossiper: Send + Sync + 'static {
    /// The error type for gossip operations.
    type Error: GossipError;

    /// This participant's id.
    fn node_id(&self) -> &NodeId;

    /// Changes the period between gossip rounds.
    fn set_gossip_interval(&self, interval: Duration);

    /// Adds a peer to exchange records with.
    async fn add_node(&self, addr: SocketAddr) -> Result<(), Self::Error>;

    /// Stops exchanging records with a peer.
    async fn remove_node(&self, addr: SocketAddr) -> Result<(), Self::Error>;

    /// Publishes (or replaces) this node's record under `key`.
    async fn update_self(&self, key: StoreKey, value: Bytes);

    /// Returns every known record under `key`, including this node's own.
    async fn get_store_key_value(&self, key: &StoreKey) -> Vec<NodeValue>;

    /// Starts gossiping.
    async fn start(&self) -> Result<(), Self::Error>;

    /// Stops gossiping and leaves the network.
    async fn stop(&self) -> Result<(), Self::Error>;
}
