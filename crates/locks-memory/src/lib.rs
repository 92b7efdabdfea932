//! In-memory (single process) implementation of lease locks for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_locks::{LockGuard, LockManager, LockManager1, LockStatus};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Lease {
    holder: String,
    token: Uuid,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

type LeaseMap = Arc<Mutex<HashMap<String, Lease>>>;

/// In-memory lease lock manager.
///
/// Clones and scopes share the same lease table. Use [`MemoryLockManager::with_holder`]
/// to hand each simulated process its own holder identity.
#[derive(Clone, Debug)]
pub struct MemoryLockManager {
    leases: LeaseMap,
    holder: String,
    prefix: Option<String>,
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLockManager {
    /// Creates a new lock manager with an empty lease table and a random holder id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            holder: Uuid::new_v4().to_string(),
            prefix: None,
        }
    }

    /// Returns a manager sharing this lease table but acting as `holder`.
    #[must_use]
    pub fn with_holder<H: Into<String>>(&self, holder: H) -> Self {
        Self {
            leases: Arc::clone(&self.leases),
            holder: holder.into(),
            prefix: self.prefix.clone(),
        }
    }

    fn get_key(&self, key: String) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key,
        }
    }

    fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<MemoryLockGuard>, Error> {
        if lease.is_zero() {
            return Err(Error::InvalidLease(key.to_string()));
        }

        let mut leases = self.leases.lock();

        if let Some(existing) = leases.get(key) {
            if existing.is_live() {
                return Ok(None);
            }

            warn!(key, previous_holder = %existing.holder, "reclaiming expired lease");
        }

        let token = Uuid::new_v4();
        leases.insert(
            key.to_string(),
            Lease {
                holder: self.holder.clone(),
                token,
                expires_at: Instant::now() + lease,
            },
        );

        debug!(key, holder = %self.holder, ?lease, "lease acquired");

        Ok(Some(MemoryLockGuard {
            leases: Arc::clone(&self.leases),
            key: key.to_string(),
            token,
            released: false,
        }))
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    type Error = Error;
    type Guard = MemoryLockGuard;

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        let key = self.get_key(resource_id);
        let leases = self.leases.lock();

        Ok(match leases.get(&key) {
            Some(lease) if lease.is_live() => {
                if lease.holder == self.holder {
                    LockStatus::HeldBySelf
                } else {
                    LockStatus::HeldByOther(lease.holder.clone())
                }
            }
            _ => LockStatus::Free,
        })
    }

    async fn lock(&self, resource_id: String, lease: Duration) -> Result<Self::Guard, Self::Error> {
        let key = self.get_key(resource_id);
        let mut poll_interval = INITIAL_POLL_INTERVAL;

        loop {
            if let Some(guard) = self.try_acquire(&key, lease)? {
                info!(key = %key, holder = %self.holder, "lock acquired");
                return Ok(guard);
            }

            debug!(key = %key, ?poll_interval, "lock held elsewhere, waiting");
            tokio::time::sleep(poll_interval).await;
            poll_interval = std::cmp::min(poll_interval * 2, MAX_POLL_INTERVAL);
        }
    }

    async fn try_lock(
        &self,
        resource_id: String,
        lease: Duration,
    ) -> Result<Option<Self::Guard>, Self::Error> {
        let key = self.get_key(resource_id);
        self.try_acquire(&key, lease)
    }
}

#[async_trait]
impl LockManager1 for MemoryLockManager {
    type Error = Error;
    type Scoped = Self;

    fn scope<S>(&self, scope: S) -> Self::Scoped
    where
        S: AsRef<str> + Send,
    {
        let prefix = match &self.prefix {
            Some(existing) => format!("{existing}:{}", scope.as_ref()),
            None => scope.as_ref().to_string(),
        };

        Self {
            leases: Arc::clone(&self.leases),
            holder: self.holder.clone(),
            prefix: Some(prefix),
        }
    }
}

/// Guard for a lease taken from a [`MemoryLockManager`].
#[derive(Debug)]
pub struct MemoryLockGuard {
    leases: LeaseMap,
    key: String,
    token: Uuid,
    released: bool,
}

impl MemoryLockGuard {
    /// Removes the lease if it is still ours. Returns whether it was still live.
    fn remove_if_owned(&self) -> bool {
        let mut leases = self.leases.lock();

        match leases.get(&self.key) {
            Some(lease) if lease.token == self.token => {
                let live = lease.is_live();
                leases.remove(&self.key);
                live
            }
            _ => false,
        }
    }
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    type Error = Error;

    fn resource_id(&self) -> &str {
        &self.key
    }

    async fn release(mut self) -> Result<(), Self::Error> {
        self.released = true;

        if self.remove_if_owned() {
            debug!(key = %self.key, "lease released");
            Ok(())
        } else {
            Err(Error::LeaseExpired(self.key.clone()))
        }
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        if !self.released && self.remove_if_owned() {
            debug!(key = %self.key, "lease released on drop");
        }
    }
}
