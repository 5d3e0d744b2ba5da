//! JSON documents on top of the primitive operations, plus the cache-aside helper.

use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::client::CacheClient;
use crate::error::CacheError;
use crate::flight::SingleFlight;
use crate::metrics::{CacheEvent, MetricsSink};

/// Typed cache over serialized JSON values.
///
/// The cache is never the source of truth: every read may miss, and a document
/// that fails to decode is treated exactly like a missing one.
#[derive(Clone)]
pub struct JsonCache {
    client: CacheClient,
    sink: Option<Arc<dyn MetricsSink>>,
    /// Gates used by `get_or_set_single_flight`.
    flights: Arc<SingleFlight>,
}

impl JsonCache {
    pub fn new(client: CacheClient) -> Self {
        JsonCache {
            client,
            sink: None,
            flights: Arc::new(SingleFlight::new()),
        }
    }

    /// Report hit/miss/decode events to `sink`.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The primitive client underneath.
    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    /// Serialize `value` and store it under `key`.
    pub async fn cache_json<T>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(value)
            .map_err(|e| CacheError::Serialization(format!("failed to encode '{}': {}", key, e)))?;
        self.client.set(key, &json, ttl_secs).await
    }

    /// Read and decode the document under `key`.
    ///
    /// Returns `None` when the key is absent or its value cannot be decoded; the
    /// decode failure is logged and reported, never returned.
    pub async fn get_cached_json<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.client.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let err = CacheError::Decode {
                    key: key.to_string(),
                    message: e.to_string(),
                };
                tracing::warn!(error = %err, "discarding undecodable cache entry");
                self.emit(CacheEvent::DecodeFailure {
                    key: key.to_string(),
                });
                Ok(None)
            }
        }
    }

    /// Cache-aside: return the cached value for `key`, or compute, store and return it.
    ///
    /// Cache read or write failures degrade to a miss and an unstored value; only
    /// `compute`'s own error is returned.
    ///
    /// Concurrent misses on the same key are *not* de-duplicated: each caller may run
    /// `compute` and the last write wins. Use [`JsonCache::get_or_set_single_flight`]
    /// when duplicate computation within this process must be avoided.
    ///
    /// # Example
    /// ```ignore
    /// let scores = cache
    ///     .get_or_set("assessment:42:scores", Some(300), || async {
    ///         db.load_scores(42).await
    ///     })
    ///     .await?;
    /// ```
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u64>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.lookup(key).await {
            return Ok(hit);
        }
        self.compute_and_store(key, ttl_secs, compute).await
    }

    /// Like [`JsonCache::get_or_set`], but concurrent misses on the same key in this
    /// process wait for the first computation and then read its result from the cache.
    ///
    /// Callers in other processes can still race.
    pub async fn get_or_set_single_flight<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u64>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.lookup(key).await {
            return Ok(hit);
        }

        let _permit = self.flights.acquire(key).await;
        // Whoever held the gate before us may have filled the cache.
        if let Some(hit) = self.lookup(key).await {
            return Ok(hit);
        }
        self.compute_and_store(key, ttl_secs, compute).await
    }

    /// Cache read for the cache-aside helpers: any failure counts as a miss.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get_cached_json(key).await {
            Ok(Some(value)) => {
                tracing::debug!(key, "cache hit");
                self.emit(CacheEvent::Hit {
                    key: key.to_string(),
                });
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn compute_and_store<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u64>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let value = compute().await?;
        let compute_ms = started.elapsed().as_secs_f64() * 1000.0;

        tracing::debug!(key, compute_ms, "cache miss");
        self.emit(CacheEvent::Miss {
            key: key.to_string(),
            compute_ms,
        });

        if let Err(e) = self.cache_json(key, &value, ttl_secs).await {
            tracing::warn!(key, error = %e, "failed to store computed value");
        }
        Ok(value)
    }
}
