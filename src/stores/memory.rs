use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::CacheError;
use crate::store::{KeyTtl, Store, Transport};

/// A stored value with its optional deadline.
#[derive(Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// State shared by the transport and every handle it opened.
struct Shared {
    entries: RwLock<HashMap<String, Slot>>,
    /// Bumped by `sever()`; handles from an older generation are dead.
    generation: AtomicU64,
    reachable: AtomicBool,
    dial_count: AtomicUsize,
    dial_delay: parking_lot::Mutex<Option<Duration>>,
}

/// In-process key-value store with TTL semantics.
///
/// This is a test double for the external store, suitable for:
/// - Unit and integration tests (including tokio's paused clock, since expiry uses `tokio::time`)
/// - Local development without a Redis instance
///
/// It also injects faults: `sever()` drops every live connection, `set_reachable(false)`
/// makes dials and commands fail, and `set_dial_delay` slows dials down.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                generation: AtomicU64::new(0),
                reachable: AtomicBool::new(true),
                dial_count: AtomicUsize::new(0),
                dial_delay: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Drop all live connections. Data is kept; new dials succeed if reachable.
    pub fn sever(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every dial by `delay`.
    pub fn set_dial_delay(&self, delay: Option<Duration>) {
        *self.shared.dial_delay.lock() = delay;
    }

    /// Number of dials attempted so far.
    pub fn dial_count(&self) -> usize {
        self.shared.dial_count.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    async fn open(&self) -> Result<Arc<dyn Store>, CacheError> {
        self.shared.dial_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.shared.dial_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(CacheError::ConnectionLost("connection refused".to_string()));
        }

        Ok(Arc::new(MemoryStore {
            shared: Arc::clone(&self.shared),
            generation: self.shared.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A handle opened by `MemoryTransport`.
pub struct MemoryStore {
    shared: Arc<Shared>,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryStore {
    fn check_link(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::ConnectionLost("connection closed".to_string()));
        }
        if !self.shared.reachable.load(Ordering::SeqCst)
            || self.shared.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(CacheError::ConnectionLost(
                "connection reset by peer".to_string(),
            ));
        }
        Ok(())
    }

    /// Read a live slot, evicting it if expired.
    async fn live_slot(&self, key: &str) -> Option<Slot> {
        let now = Instant::now();
        {
            let entries = self.shared.entries.read().await;
            match entries.get(key) {
                Some(slot) if slot.is_live(now) => return Some(slot.clone()),
                None => return None,
                Some(_) => {}
            }
        }

        // Entry is expired, remove it
        let mut entries = self.shared.entries.write().await;
        if entries.get(key).is_some_and(|slot| !slot.is_live(now)) {
            entries.remove(key);
        }
        None
    }
}

/// Deadline `secs` from `now`. A TTL too large for the clock never expires.
fn expiry_after(now: Instant, secs: u64) -> Option<Instant> {
    now.checked_add(Duration::from_secs(secs))
}

fn parse_counter(key: &str, value: &str) -> Result<i64, CacheError> {
    value.parse().map_err(|_| {
        CacheError::transport("memory", key, "value is not an integer or out of range")
    })
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check_link()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_link()?;
        Ok(self.live_slot(key).await.map(|slot| slot.value))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        self.check_link()?;
        let expires_at = ttl_secs.and_then(|secs| expiry_after(Instant::now(), secs));
        let mut entries = self.shared.entries.write().await;
        entries.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError> {
        self.check_link()?;
        let now = Instant::now();
        let mut entries = self.shared.entries.write().await;

        let mut removed = 0;
        for key in keys {
            if let Some(slot) = entries.remove(*key)
                && slot.is_live(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check_link()?;
        Ok(self.live_slot(key).await.is_some())
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<bool, CacheError> {
        self.check_link()?;
        let now = Instant::now();
        let mut entries = self.shared.entries.write().await;
        match entries.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                slot.expires_at = expiry_after(now, secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        self.check_link()?;
        let now = Instant::now();
        Ok(match self.live_slot(key).await {
            None => KeyTtl::Missing,
            Some(Slot {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => {
                // Round up so a live key never reports 0.
                let remaining = at.saturating_duration_since(now);
                KeyTtl::Expires(remaining.as_millis().div_ceil(1000) as u64)
            }
        })
    }

    async fn increment_with_expiry(&self, key: &str, window_secs: u64) -> Result<u64, CacheError> {
        self.check_link()?;
        let now = Instant::now();
        let mut entries = self.shared.entries.write().await;

        let current = match entries.get(key) {
            Some(slot) if slot.is_live(now) => Some(parse_counter(key, &slot.value)?),
            _ => None,
        };

        let count = match current {
            Some(n) => {
                let next = n + 1;
                if let Some(slot) = entries.get_mut(key) {
                    slot.value = next.to_string();
                }
                next
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Slot {
                        value: "1".to_string(),
                        expires_at: expiry_after(now, window_secs),
                    },
                );
                1
            }
        };

        u64::try_from(count).map_err(|_| {
            CacheError::transport("memory", key, format!("counter went negative: {}", count))
        })
    }

    async fn decrement_existing(&self, key: &str) -> Result<i64, CacheError> {
        self.check_link()?;
        let now = Instant::now();
        let mut entries = self.shared.entries.write().await;
        match entries.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                let next = parse_counter(key, &slot.value)? - 1;
                slot.value = next.to_string();
                Ok(next)
            }
            _ => Ok(0),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_link()?;
        let now = Instant::now();
        let entries = self.shared.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_set_delete_with_expiry() {
        let transport = MemoryTransport::new();
        let store = transport.open().await.unwrap();

        // Initially empty
        assert!(store.get("key1").await.unwrap().is_none());
        assert_eq!(store.ttl("key1").await.unwrap(), KeyTtl::Missing);

        store.set("key1", "value1", Some(10)).await.unwrap();
        store.set("key2", "value2", None).await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), Some("value1".to_string()));
        assert_eq!(store.ttl("key1").await.unwrap(), KeyTtl::Expires(10));
        assert_eq!(store.ttl("key2").await.unwrap(), KeyTtl::Persistent);

        tokio::time::advance(Duration::from_millis(9_500)).await;
        assert_eq!(store.ttl("key1").await.unwrap(), KeyTtl::Expires(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("key1").await.unwrap().is_none());
        assert!(!store.exists("key1").await.unwrap());

        assert_eq!(store.delete(&["key1", "key2", "key3"]).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_sets_ttl_only_on_first_hit() {
        let transport = MemoryTransport::new();
        let store = transport.open().await.unwrap();

        assert_eq!(store.increment_with_expiry("c", 60).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(store.increment_with_expiry("c", 60).await.unwrap(), 2);
        assert_eq!(store.ttl("c").await.unwrap(), KeyTtl::Expires(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.increment_with_expiry("c", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_huge_ttls_do_not_overflow_the_clock() {
        let transport = MemoryTransport::new();
        let store = transport.open().await.unwrap();

        store.set("forever", "v", Some(u64::MAX)).await.unwrap();
        assert_eq!(store.get("forever").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.ttl("forever").await.unwrap(), KeyTtl::Persistent);

        store.set("later", "v", Some(10)).await.unwrap();
        assert!(store.expire("later", u64::MAX).await.unwrap());
        assert_eq!(store.ttl("later").await.unwrap(), KeyTtl::Persistent);

        assert_eq!(store.increment_with_expiry("c", u64::MAX).await.unwrap(), 1);
        assert_eq!(store.increment_with_expiry("c", u64::MAX).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let transport = MemoryTransport::new();
        let store = transport.open().await.unwrap();
        store.set("c", "abc", None).await.unwrap();

        let err = store.increment_with_expiry("c", 60).await.unwrap_err();
        assert!(matches!(err, CacheError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_decrement_existing_never_creates_keys() {
        let transport = MemoryTransport::new();
        let store = transport.open().await.unwrap();

        assert_eq!(store.decrement_existing("c").await.unwrap(), 0);
        assert!(!store.exists("c").await.unwrap());

        store.increment_with_expiry("c", 60).await.unwrap();
        store.increment_with_expiry("c", 60).await.unwrap();
        assert_eq!(store.decrement_existing("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sever_kills_old_handles() {
        let transport = MemoryTransport::new();
        let old = transport.open().await.unwrap();
        old.set("k", "v", None).await.unwrap();

        transport.sever();
        let err = old.get("k").await.unwrap_err();
        assert!(err.is_connection_lost());

        // Data survives; a fresh handle sees it.
        let fresh = transport.open().await.unwrap();
        assert_eq!(fresh.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(transport.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_refuses_dials() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);
        assert!(transport.open().await.is_err());

        transport.set_reachable(true);
        assert!(transport.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_prefix_filters() {
        let transport = MemoryTransport::new();
        let store = transport.open().await.unwrap();
        store.set("session:b", "1", None).await.unwrap();
        store.set("session:a", "1", None).await.unwrap();
        store.set("ratelimit:x", "1", None).await.unwrap();

        let keys = store.scan_prefix("session:").await.unwrap();
        assert_eq!(keys, vec!["session:a".to_string(), "session:b".to_string()]);
    }
}
