use bulwark_store::{StoreError, StoreErrorKind};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// `create` hit an existing key.
    #[error("key '{0}' already exists")]
    AlreadyExists(String),

    /// The store has been switched offline.
    #[error("store is unavailable")]
    Unavailable,
}

impl StoreError for Error {
    fn kind(&self) -> StoreErrorKind {
        match self {
            Self::AlreadyExists(_) => StoreErrorKind::AlreadyExists,
            Self::Unavailable => StoreErrorKind::Unavailable,
        }
    }
}
