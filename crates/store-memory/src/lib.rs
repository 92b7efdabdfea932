//! In-memory (single process) implementation of key-value storage for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use bulwark_store::{Store, Store1};
use tokio::sync::Mutex;
use tracing::warn;

/// In-memory key-value store.
///
/// Clones and scopes share the same underlying map, so several simulated
/// nodes can point at one "cluster-wide" store.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    map: Arc<Mutex<BTreeMap<String, Bytes>>>,
    available: Arc<AtomicBool>,
    prefix: Option<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            prefix: None,
        }
    }

    /// Simulates the store becoming unreachable (or reachable again).
    ///
    /// Applies to every clone and scope of this store.
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("memory store switched offline");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable)
        }
    }

    fn get_key<K: Into<String>>(&self, key: K) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, key.into()),
            None => key.into(),
        }
    }

    fn strip_scope<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str())?.strip_prefix(':'),
            None => Some(key),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Error = Error;

    async fn create<K: Into<String> + Send>(&self, key: K, bytes: Bytes) -> Result<(), Self::Error> {
        self.ensure_available()?;
        let key = self.get_key(key);
        let mut map = self.map.lock().await;

        if map.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }

        map.insert(key, bytes);
        Ok(())
    }

    async fn del<K: Into<String> + Send>(&self, key: K) -> Result<(), Self::Error> {
        self.ensure_available()?;
        self.map.lock().await.remove(&self.get_key(key));
        Ok(())
    }

    async fn enumerate<K: Into<String> + Send>(
        &self,
        prefix: K,
    ) -> Result<Vec<(String, Bytes)>, Self::Error> {
        self.ensure_available()?;
        let full_prefix = self.get_key(prefix);
        let map = self.map.lock().await;

        Ok(map
            .range(full_prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&full_prefix))
            .filter_map(|(key, value)| {
                self.strip_scope(key)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect())
    }

    async fn get<K: Into<String> + Send>(&self, key: K) -> Result<Option<Bytes>, Self::Error> {
        self.ensure_available()?;
        let map = self.map.lock().await;
        Ok(map.get(&self.get_key(key)).cloned())
    }

    async fn keys(&self) -> Result<Vec<String>, Self::Error> {
        self.ensure_available()?;
        let map = self.map.lock().await;
        Ok(map
            .keys()
            .filter_map(|key| self.strip_scope(key).map(ToString::to_string))
            .collect())
    }

    async fn put<K: Into<String> + Send>(&self, key: K, bytes: Bytes) -> Result<(), Self::Error> {
        self.ensure_available()?;
        self.map.lock().await.insert(self.get_key(key), bytes);
        Ok(())
    }
}

impl Store1 for MemoryStore {
    type Error = Error;
    type Scoped = Self;

    fn scope<S: AsRef<str> + Send>(&self, scope: S) -> Self::Scoped {
        let prefix = match &self.prefix {
            Some(existing_scope) => format!("{}:{}", existing_scope, scope.as_ref()),
            None => scope.as_ref().to_string(),
        };

        Self {
            map: Arc::clone(&self.map),
            available: Arc::clone(&self.available),
            prefix: Some(prefix),
        }
    }
}
