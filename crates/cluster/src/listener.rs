//! Observer contract for subsystems (storage drivers and the like) that need
//! to take part in cluster lifecycle events.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::ClusterError;
use crate::node::Node;

/// Error type listeners return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Startup callbacks. Errors here abort startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartupPhase {
    /// This node is creating a brand-new cluster.
    ClusterInit,

    /// This node is joining for the first time.
    Init,

    /// This node completed a join (every start).
    Join,
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterInit => write!(f, "cluster init"),
            Self::Init => write!(f, "init"),
            Self::Join => write!(f, "join"),
        }
    }
}

/// Membership callbacks fired while running. Errors here are logged only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MembershipPhase {
    /// A peer was discovered.
    Add,

    /// A known peer changed health.
    Update,

    /// A peer was removed administratively.
    Remove,

    /// A node is leaving the cluster.
    Leave,
}

impl fmt::Display for MembershipPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Remove => write!(f, "remove"),
            Self::Leave => write!(f, "leave"),
        }
    }
}

/// A subsystem that reacts to cluster lifecycle events.
///
/// Every callback defaults to doing nothing.
#[async_trait]
pub trait ClusterListener: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Called once, only on the node that creates a new cluster.
    async fn cluster_init(&self, _self_node: &Node, _db: &Database) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called the first time this node becomes part of the cluster.
    async fn init(&self, _self_node: &Node, _db: &Database) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called every time this node joins, restarts included.
    async fn join(&self, _self_node: &Node, _db: &Database) -> Result<(), ListenerError> {
        Ok(())
    }

    /// A peer was discovered.
    async fn add(&self, _node: &Node) -> Result<(), ListenerError> {
        Ok(())
    }

    /// A known peer became unhealthy or went offline.
    async fn update(&self, _node: &Node) -> Result<(), ListenerError> {
        Ok(())
    }

    /// A peer was removed from the cluster view.
    async fn remove(&self, _node: &Node) -> Result<(), ListenerError> {
        Ok(())
    }

    /// A node is leaving.
    async fn leave(&self, _node: &Node) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Registered listeners, dispatched in registration order.
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<Vec<Arc<dyn ClusterListener>>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .inner
            .read()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        f.debug_struct("Listeners").field("names", &names).finish()
    }
}

impl Listeners {
    /// Appends a listener.
    pub fn register(&self, listener: Arc<dyn ClusterListener>) {
        self.inner.write().push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn ClusterListener>> {
        self.inner.read().clone()
    }

    /// Runs a startup phase on every listener, stopping at the first failure.
    ///
    /// Listeners that already ran are not rolled back.
    pub async fn dispatch_startup(
        &self,
        phase: StartupPhase,
        self_node: &Node,
        db: &Database,
    ) -> Result<(), ClusterError> {
        for listener in self.snapshot() {
            debug!(listener = listener.name(), %phase, "dispatching startup phase");

            let result = match phase {
                StartupPhase::ClusterInit => listener.cluster_init(self_node, db).await,
                StartupPhase::Init => listener.init(self_node, db).await,
                StartupPhase::Join => listener.join(self_node, db).await,
            };

            if let Err(source) = result {
                warn!(listener = listener.name(), %phase, "listener failed: {}", source);
                return Err(ClusterError::Listener {
                    listener: listener.name().to_string(),
                    phase,
                    source,
                });
            }
        }

        Ok(())
    }

    /// Notifies every listener of a membership change, logging failures.
    pub async fn notify(&self, phase: MembershipPhase, node: &Node) {
        for listener in self.snapshot() {
            let result = match phase {
                MembershipPhase::Add => listener.add(node).await,
                MembershipPhase::Update => listener.update(node).await,
                MembershipPhase::Remove => listener.remove(node).await,
                MembershipPhase::Leave => listener.leave(node).await,
            };

            if let Err(e) = result {
                warn!(
                    listener = listener.name(),
                    %phase,
                    node = %node.id,
                    "failed to notify listener: {}",
                    e
                );
            }
        }
    }
}
