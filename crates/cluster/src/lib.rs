//! Cluster membership for bulwark nodes.
//!
//! This crate provides:
//! - The durable cluster database, mutated only under the cluster lock
//! - A heartbeat loop publishing each node's record over gossip
//! - Failure detection and the volatile view of live nodes
//! - The listener contract subsystems use to follow membership changes
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

pub mod config;
pub mod database;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod manager;
pub mod node;
pub mod sampler;
pub mod wire;

pub use config::ClusterConfig;
pub use database::{ClusterStatus, Database, NodeEntry};
pub use error::ClusterError;
pub use heartbeat::{MembershipEvent, NodeCache, reconcile};
pub use listener::{ClusterListener, ListenerError, Listeners, MembershipPhase, StartupPhase};
pub use manager::{ClusterManager, ClusterManagerOptions, ManagerState};
pub use node::{
    Cluster, Container, Lun, MemoryUsage, Node, NodeDataValue, NodeStatus, ResourceSnapshot,
};
pub use sampler::{ProcSampler, ResourceSampler, StaticSampler, detect_external_ip};
