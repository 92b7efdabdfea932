//! In-memory gossip network for testing and local development.
//!
//! Participants live in the same process and are addressed by the socket
//! address they would bind in a real deployment. Every round, a participant
//! does a push-pull exchange with each peer it knows about and keeps the
//! newest record seen per (key, node). Peers learned from exchanged records
//! join the peer set, so one seed address is enough to reach the whole network.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bulwark_gossip::{Gossiper, NodeId, NodeValue, PeerStatus, StoreKey};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default period between gossip rounds.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(2);

/// A record goes `Down` after this many gossip intervals without a newer version.
pub const DEATH_INTERVALS: u32 = 4;

#[derive(Clone, Debug)]
struct Record {
    value: Bytes,
    version: u64,
    // Participants share the process clock, so this is carried as-is when
    // records are relayed.
    last_update: Instant,
    origin: SocketAddr,
}

type Exchanged = (StoreKey, NodeId, Record);

#[derive(Debug)]
struct Participant {
    node_id: NodeId,
    bind: SocketAddr,
    records: RwLock<HashMap<StoreKey, HashMap<NodeId, Record>>>,
    peers: RwLock<BTreeSet<SocketAddr>>,
    version: AtomicU64,
    interval_ms: AtomicU64,
}

impl Participant {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    fn snapshot(&self) -> Vec<Exchanged> {
        self.records
            .read()
            .iter()
            .flat_map(|(key, by_node)| {
                by_node
                    .iter()
                    .map(move |(id, record)| (key.clone(), id.clone(), record.clone()))
            })
            .collect()
    }

    /// Merges records from a peer, returning how many were newer than ours.
    fn merge(&self, incoming: Vec<Exchanged>) -> usize {
        let mut updated = 0;
        let mut learned = Vec::new();

        {
            let mut records = self.records.write();

            for (key, id, record) in incoming {
                if id == self.node_id {
                    continue;
                }

                if record.origin != self.bind {
                    learned.push(record.origin);
                }

                let by_node = records.entry(key).or_default();
                // A restarted participant publishes low versions again, but
                // with a later timestamp.
                let newer = by_node.get(&id).is_none_or(|existing| {
                    existing.version < record.version || existing.last_update < record.last_update
                });

                if newer {
                    by_node.insert(id, record);
                    updated += 1;
                }
            }
        }

        if !learned.is_empty() {
            let mut peers = self.peers.write();
            for addr in learned {
                if peers.insert(addr) {
                    debug!(node = %self.node_id, peer = %addr, "learned peer through gossip");
                }
            }
        }

        updated
    }
}

/// A set of in-process gossip participants reachable by address.
#[derive(Clone, Debug, Default)]
pub struct MemoryGossipNetwork {
    members: Arc<DashMap<SocketAddr, Arc<Participant>>>,
}

impl MemoryGossipNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a participant that will bind `bind` when started.
    #[must_use]
    pub fn gossiper<N: Into<NodeId>>(&self, bind: SocketAddr, node_id: N) -> MemoryGossiper {
        let participant = Participant {
            node_id: node_id.into(),
            bind,
            records: RwLock::new(HashMap::new()),
            peers: RwLock::new(BTreeSet::new()),
            version: AtomicU64::new(0),
            interval_ms: AtomicU64::new(duration_millis(DEFAULT_GOSSIP_INTERVAL)),
        };

        MemoryGossiper {
            network: self.clone(),
            participant: Arc::new(participant),
            task: Mutex::new(None),
        }
    }

    /// Addresses currently bound on the network.
    #[must_use]
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.members.iter().map(|entry| *entry.key()).collect();
        addrs.sort();
        addrs
    }

    fn exchange(&self, me: &Arc<Participant>) {
        let peers: Vec<SocketAddr> = me.peers.read().iter().copied().collect();

        for addr in peers {
            let Some(peer) = self.members.get(&addr).map(|entry| Arc::clone(entry.value())) else {
                debug!(node = %me.node_id, peer = %addr, "peer not reachable");
                continue;
            };

            if Arc::ptr_eq(&peer, me) {
                continue;
            }

            let pulled = me.merge(peer.snapshot());
            let pushed = peer.merge(me.snapshot());

            debug!(node = %me.node_id, peer = %addr, pulled, pushed, "gossip exchange");
        }
    }
}

struct RoundTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// A gossip participant on a [`MemoryGossipNetwork`].
pub struct MemoryGossiper {
    network: MemoryGossipNetwork,
    participant: Arc<Participant>,
    task: Mutex<Option<RoundTask>>,
}

impl std::fmt::Debug for MemoryGossiper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGossiper")
            .field("node_id", &self.participant.node_id)
            .field("bind", &self.participant.bind)
            .finish_non_exhaustive()
    }
}

impl MemoryGossiper {
    /// Peers this participant currently exchanges with.
    #[must_use]
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.participant.peers.read().iter().copied().collect()
    }

    /// Whether the background round task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Runs one gossip round immediately.
    pub fn round(&self) {
        self.network.exchange(&self.participant);
    }

    /// Period after which a silent peer is reported `Down`.
    #[must_use]
    pub fn death_threshold(&self) -> Duration {
        self.participant.interval() * DEATH_INTERVALS
    }
}

#[async_trait]
impl Gossiper for MemoryGossiper {
    type Error = Error;

    fn node_id(&self) -> &NodeId {
        &self.participant.node_id
    }

    fn set_gossip_interval(&self, interval: Duration) {
        self.participant
            .interval_ms
            .store(duration_millis(interval).max(1), Ordering::Relaxed);
    }

    async fn add_node(&self, addr: SocketAddr) -> Result<(), Self::Error> {
        if addr == self.participant.bind {
            return Err(Error::SelfAddress(addr));
        }

        if self.participant.peers.write().insert(addr) {
            info!(node = %self.participant.node_id, peer = %addr, "added gossip peer");
        }

        Ok(())
    }

    async fn remove_node(&self, addr: SocketAddr) -> Result<(), Self::Error> {
        if self.participant.peers.write().remove(&addr) {
            info!(node = %self.participant.node_id, peer = %addr, "removed gossip peer");
        }

        Ok(())
    }

    async fn update_self(&self, key: StoreKey, value: Bytes) {
        let version = self.participant.version.fetch_add(1, Ordering::SeqCst) + 1;
        let record = Record {
            value,
            version,
            last_update: Instant::now(),
            origin: self.participant.bind,
        };

        self.participant
            .records
            .write()
            .entry(key)
            .or_default()
            .insert(self.participant.node_id.clone(), record);
    }

    async fn get_store_key_value(&self, key: &StoreKey) -> Vec<NodeValue> {
        let threshold = self.death_threshold();
        let now = Instant::now();
        let records = self.participant.records.read();

        let Some(by_node) = records.get(key) else {
            return Vec::new();
        };

        let mut values: Vec<NodeValue> = by_node
            .iter()
            .map(|(id, record)| {
                let fresh = now.saturating_duration_since(record.last_update) <= threshold;
                let status = if *id == self.participant.node_id || fresh {
                    PeerStatus::Up
                } else {
                    PeerStatus::Down
                };

                NodeValue {
                    id: id.clone(),
                    value: record.value.clone(),
                    version: record.version,
                    last_update: record.last_update,
                    status,
                }
            })
            .collect();

        values.sort_by(|a, b| a.id.cmp(&b.id));
        values
    }

    async fn start(&self) -> Result<(), Self::Error> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let bind = self.participant.bind;
        match self.network.members.entry(bind) {
            Entry::Occupied(_) => return Err(Error::AddressInUse(bind)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&self.participant));
            }
        }

        let shutdown = CancellationToken::new();
        let network = self.network.clone();
        let participant = Arc::clone(&self.participant);
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(participant.interval()) => {
                        network.exchange(&participant);
                    }
                }
            }

            debug!(node = %participant.node_id, "gossip round task exiting");
        });

        *task = Some(RoundTask { shutdown, handle });
        info!(node = %self.participant.node_id, %bind, "gossiper started");

        Ok(())
    }

    async fn stop(&self) -> Result<(), Self::Error> {
        let Some(RoundTask { shutdown, handle }) = self.task.lock().take() else {
            return Ok(());
        };

        shutdown.cancel();
        if let Err(e) = handle.await {
            warn!(node = %self.participant.node_id, "gossip round task failed: {}", e);
        }

        self.network
            .members
            .remove_if(&self.participant.bind, |_, member| {
                Arc::ptr_eq(member, &self.participant)
            });

        info!(node = %self.participant.node_id, "gossiper stopped");
        Ok(())
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    fn addr(last_octet: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, last_octet], 9002))
    }

    fn key() -> StoreKey {
        StoreKey::new("heartbeat-test")
    }

    #[tokio::test]
    async fn test_records_spread_through_seed() {
        let network = MemoryGossipNetwork::new();
        let a = network.gossiper(addr(1), "a");
        let b = network.gossiper(addr(2), "b");
        let c = network.gossiper(addr(3), "c");

        for g in [&a, &b, &c] {
            g.start().await.unwrap();
            g.update_self(key(), Bytes::from(g.node_id().to_string())).await;
        }

        // b and c only know about a.
        b.add_node(addr(1)).await.unwrap();
        c.add_node(addr(1)).await.unwrap();

        b.round();
        c.round();
        b.round();

        let seen: Vec<_> = b
            .get_store_key_value(&key())
            .await
            .into_iter()
            .map(|v| v.id.to_string())
            .collect();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(a.peers().contains(&addr(2)));
        assert!(b.peers().contains(&addr(3)));

        for g in [&a, &b, &c] {
            g.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_newer_version_wins() {
        let network = MemoryGossipNetwork::new();
        let a = network.gossiper(addr(1), "a");
        let b = network.gossiper(addr(2), "b");
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.add_node(addr(1)).await.unwrap();

        a.update_self(key(), Bytes::from_static(b"v1")).await;
        b.round();
        a.update_self(key(), Bytes::from_static(b"v2")).await;
        b.round();

        let values = b.get_store_key_value(&key()).await;
        let from_a = values.iter().find(|v| v.id.as_str() == "a").unwrap();
        assert_eq!(from_a.value, Bytes::from_static(b"v2"));
        assert_eq!(from_a.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_participant_supersedes_old_record() {
        let network = MemoryGossipNetwork::new();
        let a = network.gossiper(addr(1), "a");
        let b = network.gossiper(addr(2), "b");
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.add_node(addr(1)).await.unwrap();

        a.update_self(key(), Bytes::from_static(b"old-1")).await;
        a.update_self(key(), Bytes::from_static(b"old-2")).await;
        b.round();
        a.stop().await.unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        let restarted = network.gossiper(addr(1), "a");
        restarted.start().await.unwrap();
        restarted.update_self(key(), Bytes::from_static(b"new")).await;
        b.round();

        let values = b.get_store_key_value(&key()).await;
        let from_a = values.iter().find(|v| v.id.as_str() == "a").unwrap();
        assert_eq!(from_a.value, Bytes::from_static(b"new"));
        assert_eq!(from_a.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_goes_down() {
        let network = MemoryGossipNetwork::new();
        let a = network.gossiper(addr(1), "a");
        let b = network.gossiper(addr(2), "b");
        for g in [&a, &b] {
            g.set_gossip_interval(Duration::from_millis(100));
            g.start().await.unwrap();
        }
        b.add_node(addr(1)).await.unwrap();

        a.update_self(key(), Bytes::from_static(b"alive")).await;
        b.round();
        let status = |values: Vec<NodeValue>| {
            values.into_iter().find(|v| v.id.as_str() == "a").map(|v| v.status)
        };
        assert_eq!(status(b.get_store_key_value(&key()).await), Some(PeerStatus::Up));

        a.stop().await.unwrap();
        tokio::time::advance(b.death_threshold() + Duration::from_millis(1)).await;

        assert_eq!(status(b.get_store_key_value(&key()).await), Some(PeerStatus::Down));
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_own_record_always_up() {
        let network = MemoryGossipNetwork::new();
        let a = network.gossiper(addr(1), "a");
        a.update_self(key(), Bytes::from_static(b"me")).await;

        let values = a.get_store_key_value(&key()).await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].status, PeerStatus::Up);
    }

    #[tokio::test]
    async fn test_address_errors() {
        let network = MemoryGossipNetwork::new();
        let a = network.gossiper(addr(1), "a");
        let imposter = network.gossiper(addr(1), "imposter");

        assert_matches!(a.add_node(addr(1)).await, Err(Error::SelfAddress(_)));

        a.start().await.unwrap();
        assert_matches!(a.start().await, Err(Error::AlreadyStarted));
        assert_matches!(imposter.start().await, Err(Error::AddressInUse(_)));

        a.stop().await.unwrap();
        assert!(network.bound_addresses().is_empty());
        imposter.start().await.unwrap();
        imposter.stop().await.unwrap();
    }
}
