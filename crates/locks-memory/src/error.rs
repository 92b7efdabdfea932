use bulwark_locks::LockManagerError;
use thiserror::Error;

/// Errors that can occur in the memory lock manager.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A zero-length lease was requested.
    #[error("lease for '{0}' must be longer than zero")]
    InvalidLease(String),

    /// The lease lapsed (and may have been taken by someone else) before release.
    #[error("lease on '{0}' expired before it was released")]
    LeaseExpired(String),
}

impl LockManagerError for Error {
    fn is_lease_expired(&self) -> bool {
        matches!(self, Self::LeaseExpired(_))
    }
}
