//! Abstract interface for cluster-wide lease locks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for `LockManager` errors
pub trait LockManagerError: Debug + Error + Send + Sync + 'static {
    /// Returns true if the error means the lease ran out before it was released.
    fn is_lease_expired(&self) -> bool {
        false
    }
}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free (never taken, released, or its lease ran out).
    Free,

    /// The lock is held by another holder, identified by the String.
    HeldByOther(String),

    /// The lock is held by the current manager.
    HeldBySelf,
}

/// A held lease.
///
/// Releasing explicitly reports whether the lease was still ours at the time
/// of release. Dropping an unreleased guard releases it on a best-effort basis.
#[async_trait]
pub trait LockGuard: Send + Sync + 'static {
    /// The error type for release.
    type Error: LockManagerError;

    /// The resource this guard covers.
    fn resource_id(&self) -> &str;

    /// Releases the lease.
    async fn release(self) -> Result<(), Self::Error>;
}

/// A distributed lock manager handing out leases with a bounded lifetime.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockManagerError;

    /// The guard type returned on acquisition.
    type Guard: LockGuard<Error = Self::Error>;

    /// Checks the status of a lock.
    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error>;

    /// Acquires a lease on `resource_id`, waiting until it becomes available.
    ///
    /// The lease lapses after `lease` unless released earlier.
    async fn lock(&self, resource_id: String, lease: Duration) -> Result<Self::Guard, Self::Error>;

    /// Attempts to acquire a lease without waiting.
    ///
    /// Returns `Ok(None)` when someone else holds a live lease.
    async fn try_lock(
        &self,
        resource_id: String,
        lease: Duration,
    ) -> Result<Option<Self::Guard>, Self::Error>;
}

/// A lock manager that can be narrowed to a scope (for example one cluster).
#[async_trait]
pub trait LockManager1
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the lock manager.
    type Error: LockManagerError;

    /// The scoped lock manager type.
    type Scoped: LockManager<Error = Self::Error>;

    /// Creates a scoped lock manager.
    fn scope<S>(&self, scope: S) -> Self::Scoped
    where
        S: AsRef<str> + Send;
}
