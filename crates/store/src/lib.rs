//! Abstract interface for the shared key-value store backing cluster state.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug};

use async_trait::async_trait;
use bytes::Bytes;

/// The kind of a store error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreErrorKind {
    /// `create` was called for a key that already exists.
    AlreadyExists,

    /// The store could not be reached.
    Unavailable,

    /// Anything else.
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "already exists"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Marker trait for `Store` errors
pub trait StoreError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error.
    fn kind(&self) -> StoreErrorKind;
}

/// A key-value store with asynchronous operations.
///
/// Missing keys are not errors: `get` returns `Ok(None)` and `del` is a no-op.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: StoreError;

    /// Stores `bytes` under `key` only if the key does not exist yet.
    async fn create<K: Into<String> + Send>(&self, key: K, bytes: Bytes) -> Result<(), Self::Error>;

    /// Deletes a key.
    async fn del<K: Into<String> + Send>(&self, key: K) -> Result<(), Self::Error>;

    /// Returns every key/value pair whose key starts with `prefix`, ordered by key.
    async fn enumerate<K: Into<String> + Send>(
        &self,
        prefix: K,
    ) -> Result<Vec<(String, Bytes)>, Self::Error>;

    /// Retrieves the value stored under `key`.
    async fn get<K: Into<String> + Send>(&self, key: K) -> Result<Option<Bytes>, Self::Error>;

    /// Retrieves all keys in the store.
    async fn keys(&self) -> Result<Vec<String>, Self::Error>;

    /// Stores `bytes` under `key`, replacing any previous value.
    async fn put<K: Into<String> + Send>(&self, key: K, bytes: Bytes) -> Result<(), Self::Error>;
}

/// A store that can be narrowed to a scope (for example one cluster).
pub trait Store1: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: StoreError;

    /// The scoped store type.
    type Scoped: Store<Error = Self::Error>;

    /// Adds a scope and makes the store usable.
    fn scope<S: AsRef<str> + Send>(&self, scope: S) -> Self::Scoped;
}
