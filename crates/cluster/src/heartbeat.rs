//! Heartbeat and failure detection.
//!
//! Each tick publishes the self node over gossip, reads every peer's record
//! back and folds it into the node cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bulwark_gossip::{Gossiper, NodeValue, PeerStatus, StoreKey};
use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::listener::{Listeners, MembershipPhase};
use crate::node::{Node, NodeStatus};
use crate::sampler::ResourceSampler;
use crate::wire;

/// Volatile view of live nodes, keyed by id.
pub type NodeCache = HashMap<String, Node>;

/// What a reconciliation pass decided about one peer record.
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipEvent {
    /// An unknown peer reported up; it is now cached.
    Added(Node),

    /// A cached peer reported itself unhealthy; it was evicted.
    Unhealthy(Node),

    /// Gossip marked a cached peer down; it was evicted with status `Offline`.
    Offline(Node),

    /// A cached peer's record was replaced with a fresher one.
    Refreshed(String),
}

/// Folds gossip records into `cache`.
///
/// Records for `self_id` and records that fail to decode are skipped. An
/// unknown peer that gossip reports down is ignored.
pub fn reconcile(cache: &mut NodeCache, self_id: &str, values: Vec<NodeValue>) -> Vec<MembershipEvent> {
    let mut events = Vec::new();

    for value in values {
        let mut node: Node = match wire::decode(&value.value) {
            Ok(node) => node,
            Err(e) => {
                warn!(peer = %value.id, "received a bad heartbeat record: {}", e);
                continue;
            }
        };

        if node.id != value.id.as_str() {
            warn!(peer = %value.id, claimed = %node.id, "heartbeat record id does not match its publisher");
            continue;
        }

        if node.id == self_id {
            continue;
        }

        if cache.contains_key(&node.id) {
            if !node.status.is_ok() {
                cache.remove(&node.id);
                events.push(MembershipEvent::Unhealthy(node));
            } else if value.status == PeerStatus::Down {
                cache.remove(&node.id);
                node.status = NodeStatus::Offline;
                events.push(MembershipEvent::Offline(node));
            } else {
                let id = node.id.clone();
                cache.insert(id.clone(), node);
                events.push(MembershipEvent::Refreshed(id));
            }
        } else if value.status == PeerStatus::Up {
            cache.insert(node.id.clone(), node.clone());
            events.push(MembershipEvent::Added(node));
        }
    }

    events
}

/// State shared between the manager and its heartbeat task.
pub(crate) struct Heartbeat<G: Gossiper> {
    pub(crate) gossip: Arc<G>,
    pub(crate) sampler: Arc<dyn ResourceSampler>,
    pub(crate) listeners: Arc<Listeners>,
    pub(crate) self_node: Arc<SyncRwLock<Node>>,
    pub(crate) cache: Arc<RwLock<NodeCache>>,
    pub(crate) updates_enabled: Arc<AtomicBool>,
    pub(crate) key: StoreKey,
}

impl<G: Gossiper> Heartbeat<G> {
    /// Resamples the self node without touching the cache.
    pub(crate) async fn sample_self(&self) -> Node {
        let resources = self.sampler.sample().await;

        let mut self_node = self.self_node.write();
        self_node.resources = resources;
        self_node.timestamp = Utc::now();
        self_node.clone()
    }

    /// Resamples the self node and stores it in the cache.
    pub(crate) async fn refresh_self(&self) -> Node {
        let node = self.sample_self().await;
        self.cache.write().await.insert(node.id.clone(), node.clone());
        node
    }

    /// Runs one heartbeat: publish, read back, reconcile, notify.
    pub(crate) async fn tick(&self) {
        let node = self.refresh_self().await;

        match wire::encode(&node) {
            Ok(bytes) => self.gossip.update_self(self.key.clone(), bytes).await,
            Err(e) => warn!(node = %node.id, "unable to encode heartbeat: {}", e),
        }

        let values = self.gossip.get_store_key_value(&self.key).await;
        let events = {
            let mut cache = self.cache.write().await;
            reconcile(&mut cache, &node.id, values)
        };

        let notify = self.updates_enabled.load(Ordering::SeqCst);

        for event in events {
            match event {
                MembershipEvent::Added(peer) => {
                    warn!(peer = %peer.id, ip = %peer.ip, "detected node to be in the cluster");
                    if notify {
                        self.listeners.notify(MembershipPhase::Add, &peer).await;
                    }
                }
                MembershipEvent::Unhealthy(peer) => {
                    warn!(peer = %peer.id, status = %peer.status, "detected node to be unhealthy");
                    if notify {
                        self.listeners.notify(MembershipPhase::Update, &peer).await;
                    }
                }
                MembershipEvent::Offline(peer) => {
                    warn!(peer = %peer.id, "detected node to be offline due to inactivity");
                    if notify {
                        self.listeners.notify(MembershipPhase::Update, &peer).await;
                    }
                }
                MembershipEvent::Refreshed(id) => {
                    debug!(peer = %id, "refreshed node");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bulwark_gossip::NodeId;
    use bytes::Bytes;
    use tokio::time::Instant;

    fn peer(id: &str, status: NodeStatus) -> Node {
        let mut node = Node::new(id);
        node.status = status;
        node
    }

    fn value(node: &Node, status: PeerStatus) -> NodeValue {
        NodeValue {
            id: NodeId::new(node.id.clone()),
            value: wire::encode(node).unwrap(),
            version: 1,
            last_update: Instant::now(),
            status,
        }
    }

    fn cache_of(nodes: &[Node]) -> NodeCache {
        nodes.iter().map(|n| (n.id.clone(), n.clone())).collect()
    }

    #[test]
    fn test_unknown_up_peer_is_added() {
        let mut cache = NodeCache::new();
        let m = peer("m", NodeStatus::Ok);

        let events = reconcile(&mut cache, "self", vec![value(&m, PeerStatus::Up)]);

        assert_eq!(events, vec![MembershipEvent::Added(m.clone())]);
        assert_eq!(cache.get("m"), Some(&m));

        // Seen again: refreshed, not re-added.
        let events = reconcile(&mut cache, "self", vec![value(&m, PeerStatus::Up)]);
        assert_eq!(events, vec![MembershipEvent::Refreshed("m".to_string())]);
    }

    #[test]
    fn test_unknown_down_peer_is_ignored() {
        let mut cache = NodeCache::new();
        let m = peer("m", NodeStatus::Ok);

        assert!(reconcile(&mut cache, "self", vec![value(&m, PeerStatus::Down)]).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unhealthy_peer_is_evicted() {
        let mut cache = cache_of(&[peer("n", NodeStatus::Ok)]);
        let sick = peer("n", NodeStatus::Error);

        let events = reconcile(&mut cache, "self", vec![value(&sick, PeerStatus::Up)]);

        assert_eq!(events, vec![MembershipEvent::Unhealthy(sick)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_down_peer_goes_offline() {
        let healthy = peer("n", NodeStatus::Ok);
        let mut cache = cache_of(&[healthy.clone()]);

        let events = reconcile(&mut cache, "self", vec![value(&healthy, PeerStatus::Down)]);

        assert_eq!(
            events,
            vec![MembershipEvent::Offline(Node {
                status: NodeStatus::Offline,
                ..healthy
            })]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_refresh_replaces_record() {
        let stale = peer("n", NodeStatus::Ok);
        let mut cache = cache_of(&[stale]);
        let mut fresh = peer("n", NodeStatus::Ok);
        fresh.resources.cpu = 80.0;

        reconcile(&mut cache, "self", vec![value(&fresh, PeerStatus::Up)]);

        assert_eq!(cache["n"].resources.cpu, 80.0);
    }

    #[test]
    fn test_skips_self_and_garbage() {
        let me = peer("self", NodeStatus::Ok);
        let mut cache = cache_of(&[me.clone()]);
        let garbage = NodeValue {
            id: NodeId::new("junk"),
            value: Bytes::from_static(b"\x00\x01"),
            version: 1,
            last_update: Instant::now(),
            status: PeerStatus::Up,
        };
        let mut liar = value(&peer("x", NodeStatus::Ok), PeerStatus::Up);
        liar.id = NodeId::new("y");

        let events = reconcile(
            &mut cache,
            "self",
            vec![value(&me, PeerStatus::Down), garbage, liar],
        );

        assert!(events.is_empty());
        assert_eq!(cache.len(), 1);
    }
}
