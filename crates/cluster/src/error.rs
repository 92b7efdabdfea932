//! Error types for the cluster manager.

use bulwark_store::{StoreError, StoreErrorKind};
use thiserror::Error;

use crate::database::ClusterStatus;
use crate::listener::{ListenerError, StartupPhase};
use crate::wire::WireError;

/// Errors surfaced by the cluster manager.
///
/// Everything returned from [`crate::ClusterManager::start`] is fatal for the
/// process; the caller decides how to exit.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// `start` was called on a manager that is not fresh.
    #[error("cluster manager already started")]
    AlreadyStarted,

    /// Cluster data could not be encoded or decoded.
    #[error("cluster data codec error: {0}")]
    Codec(#[from] WireError),

    /// The gossip layer refused an operation.
    #[error("gossip error: {0}")]
    Gossip(String),

    /// A listener failed during a startup phase.
    #[error("listener '{listener}' failed during {phase}: {source}")]
    Listener {
        /// Name reported by the listener.
        listener: String,

        /// Phase that was being dispatched.
        phase: StartupPhase,

        /// The listener's error.
        #[source]
        source: ListenerError,
    },

    /// The cluster lock could not be acquired.
    #[error("unable to obtain cluster lock: {0}")]
    Lock(String),

    /// This node's address could not be determined.
    #[error("unable to determine node address: {0}")]
    Network(#[from] std::io::Error),

    /// No live node with this id is known.
    #[error("unable to locate node '{0}'")]
    NodeNotFound(String),

    /// The operation needs a running manager.
    #[error("cluster manager is not running")]
    NotRunning,

    /// The shared key-value store failed.
    #[error("store error ({kind}): {message}")]
    Store {
        /// Kind reported by the store.
        kind: StoreErrorKind,

        /// Store error message.
        message: String,
    },

    /// The database is in a state this node does not know how to join.
    #[error("cluster is in an unexpected state: {0:?}")]
    UnexpectedState(ClusterStatus),

    /// The cluster lock could not be released, most likely because startup
    /// outlived the lease.
    #[error("unable to release cluster lock (did startup outlive the lease?): {0}")]
    Unlock(String),
}

impl ClusterError {
    pub(crate) fn store<E: StoreError>(error: &E) -> Self {
        Self::Store {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
