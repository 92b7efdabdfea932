//! The durable cluster record kept in the shared key-value store.
//!
//! Only mutate it while holding the cluster lock ([`LOCK_KEY`]).

use std::collections::BTreeMap;
use std::net::IpAddr;

use bulwark_store::Store;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClusterError;
use crate::wire;

/// Store key of the database, relative to the cluster scope.
pub const DATABASE_KEY: &str = "cluster/database";

/// Lock resource serializing database mutation, relative to the cluster scope.
pub const LOCK_KEY: &str = "cluster/lock";

/// Lifecycle status of the cluster as a whole.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// No node has initialized the cluster yet.
    #[default]
    Init,

    /// Initialized and joinable.
    Ok,

    /// Marked unusable; nodes refuse to join.
    Faulted,
}

/// Durable registry record of a node that has joined at least once.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node id.
    pub id: String,

    /// Address the node advertised when it last joined.
    pub ip: IpAddr,
}

/// The durable cluster record.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Database {
    /// Cluster status.
    pub status: ClusterStatus,

    /// Every node that has ever joined, keyed by id.
    pub node_entries: BTreeMap<String, NodeEntry>,
}

impl Database {
    /// Whether `id` has joined before.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.node_entries.contains_key(id)
    }

    /// Adds or refreshes an entry. Returns whether the node was already registered.
    pub fn register(&mut self, entry: NodeEntry) -> bool {
        self.node_entries.insert(entry.id.clone(), entry).is_some()
    }
}

/// Reads the database. A missing key is a fresh cluster in `Init` status.
pub async fn read_database<S: Store>(store: &S) -> Result<Database, ClusterError> {
    match store
        .get(DATABASE_KEY)
        .await
        .map_err(|e| ClusterError::store(&e))?
    {
        Some(bytes) => Ok(wire::decode(&bytes)?),
        None => {
            debug!("no cluster database found, treating cluster as new");
            Ok(Database::default())
        }
    }
}

/// Writes the database, replacing the stored copy.
pub async fn write_database<S: Store>(store: &S, database: &Database) -> Result<(), ClusterError> {
    let bytes = wire::encode(database)?;

    store
        .put(DATABASE_KEY, bytes)
        .await
        .map_err(|e| ClusterError::store(&e))
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use bulwark_store::{Store1, StoreErrorKind};
    use bulwark_store_memory::MemoryStore;
    use bytes::Bytes;

    fn entry(id: &str, ip: &str) -> NodeEntry {
        NodeEntry {
            id: id.to_string(),
            ip: ip.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_missing_database_is_new_cluster() {
        let store = MemoryStore::new().scope("c1");

        let database = read_database(&store).await.unwrap();
        assert_eq!(database.status, ClusterStatus::Init);
        assert!(database.node_entries.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new().scope("c1");
        let mut database = Database {
            status: ClusterStatus::Ok,
            ..Database::default()
        };
        assert!(!database.register(entry("a", "10.0.0.1")));
        assert!(database.register(entry("a", "10.0.0.2")));

        write_database(&store, &database).await.unwrap();
        let read = read_database(&store).await.unwrap();

        assert_eq!(read, database);
        assert_eq!(read.node_entries["a"].ip, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let root = MemoryStore::new();
        let store = root.scope("c1");
        root.set_available(false);

        assert_matches!(
            read_database(&store).await,
            Err(ClusterError::Store {
                kind: StoreErrorKind::Unavailable,
                ..
            })
        );
        assert_matches!(
            write_database(&store, &Database::default()).await,
            Err(ClusterError::Store { .. })
        );
    }

    #[tokio::test]
    async fn test_corrupt_database() {
        let store = MemoryStore::new().scope("c1");
        store
            .put(DATABASE_KEY, Bytes::from_static(b"{\"schema\":1,\"payload\":{\"status\":\"bogus\"}}"))
            .await
            .unwrap();

        assert_matches!(read_database(&store).await, Err(ClusterError::Codec(_)));
    }
}
