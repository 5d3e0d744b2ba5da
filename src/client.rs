//! Primitive cache operations over the managed connection.

use std::future::Future;
use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::error::CacheError;
use crate::store::{KeyTtl, Store};

/// Thin, uniform wrappers over the live store handle.
///
/// Every call requires a ready connection and fails fast with `NotConnected`
/// otherwise. A dropped link is reported to the manager, which reconnects in the
/// background; the failing call still returns its error.
#[derive(Clone)]
pub struct CacheClient {
    manager: ConnectionManager,
}

impl CacheClient {
    pub fn new(manager: ConnectionManager) -> Self {
        CacheClient { manager }
    }

    /// The connection manager behind this client.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    async fn run<T, F, Fut>(&self, command: F) -> Result<T, CacheError>
    where
        F: FnOnce(Arc<dyn Store>) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let store = self.manager.handle()?;
        let result = command(Arc::clone(&store)).await;
        if let Err(err) = &result
            && err.is_connection_lost()
        {
            self.manager.connection_lost(&store, &err.to_string());
        }
        result
    }

    /// Store `value` under `key`, expiring after `ttl_secs` when given.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<(), CacheError> {
        self.run(|store| async move { store.set(key, value, ttl_secs).await })
            .await
    }

    /// Return the stored string, or `None` when the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.run(|store| async move { store.get(key).await }).await
    }

    /// Remove the keys and return how many were actually removed.
    pub async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run(|store| async move { store.delete(keys).await })
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.run(|store| async move { store.exists(key).await })
            .await
    }

    /// Set a TTL on an existing key. Returns `false` when the key does not exist.
    pub async fn expire(&self, key: &str, secs: u64) -> Result<bool, CacheError> {
        self.run(|store| async move { store.expire(key, secs).await })
            .await
    }

    pub async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        self.run(|store| async move { store.ttl(key).await }).await
    }

    /// Atomically increment `key`; the TTL is applied only when this call created it.
    pub async fn increment_with_expiry(
        &self,
        key: &str,
        window_secs: u64,
    ) -> Result<u64, CacheError> {
        self.run(|store| async move { store.increment_with_expiry(key, window_secs).await })
            .await
    }

    /// Decrement `key` if it exists. Returns 0 for an absent key.
    pub async fn decrement_existing(&self, key: &str) -> Result<i64, CacheError> {
        self.run(|store| async move { store.decrement_existing(key).await })
            .await
    }

    /// Enumerate keys under `prefix`.
    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.run(|store| async move { store.scan_prefix(prefix).await })
            .await
    }

    /// Delete every key under `prefix` (enumerate, then delete in one call).
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let keys = self.scan_prefix(prefix).await?;
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let removed = self.delete(&refs).await?;
        tracing::debug!(prefix, removed, "deleted keys by prefix");
        Ok(removed)
    }
}
