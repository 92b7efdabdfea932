use std::net::SocketAddr;

use bulwark_gossip::GossipError;
use thiserror::Error;

/// Errors that can occur in the memory gossip network.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Another participant is already bound to the address.
    #[error("address {0} is already bound on this gossip network")]
    AddressInUse(SocketAddr),

    /// `start` was called twice.
    #[error("gossiper is already started")]
    AlreadyStarted,

    /// A participant was asked to peer with its own bind address.
    #[error("refusing to add own address {0} as a peer")]
    SelfAddress(SocketAddr),
}

impl GossipError for Error {}
