use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CacheError;

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key expires in this many seconds.
    Expires(u64),
    /// The key exists but has no expiration.
    Persistent,
    /// The key does not exist.
    Missing,
}

impl KeyTtl {
    /// Map the Redis `TTL` reply (`-2` absent, `-1` no expiry) onto `KeyTtl`.
    pub fn from_reply(reply: i64) -> Self {
        match reply {
            -2 => KeyTtl::Missing,
            r if r < 0 => KeyTtl::Persistent,
            r => KeyTtl::Expires(r as u64),
        }
    }

    /// Seconds left, if the key has an expiration.
    pub fn seconds(&self) -> Option<u64> {
        match self {
            KeyTtl::Expires(secs) => Some(*secs),
            _ => None,
        }
    }
}

/// A live handle onto the key-value store.
///
/// Implementations map each method onto one store command (or one atomic script)
/// and classify failures: a dropped link must surface as `CacheError::ConnectionLost`
/// so the connection manager can reconnect, and a command deadline as `CacheError::Timeout`.
#[async_trait]
pub trait Store: Send + Sync {
    /// A name for logs and errors.
    ///
    /// # Example
    /// - "memory"
    /// - "redis"
    fn name(&self) -> &'static str;

    /// Round-trip check used right after dialing.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Return the stored string, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`, expiring after `ttl_secs` when given.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CacheError>;

    /// Remove the keys and return how many existed.
    async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Set a TTL on an existing key. `false` if the key does not exist.
    async fn expire(&self, key: &str, secs: u64) -> Result<bool, CacheError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError>;

    /// Atomically increment the counter and, only when this increment created it,
    /// set its TTL to `window_secs`. Returns the post-increment count.
    async fn increment_with_expiry(&self, key: &str, window_secs: u64) -> Result<u64, CacheError>;

    /// Decrement the counter only if it exists. Returns the new value, or 0 when absent.
    async fn decrement_existing(&self, key: &str) -> Result<i64, CacheError>;

    /// Enumerate keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Gracefully close the connection.
    async fn close(&self) -> Result<(), CacheError>;
}

/// Dials the configured endpoint and yields live `Store` handles.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Endpoint description for logs. Must not contain credentials.
    fn endpoint(&self) -> String;

    /// Open a new connection. The returned handle must be ready for commands.
    async fn open(&self) -> Result<Arc<dyn Store>, CacheError>;
}
