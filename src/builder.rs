//! Builder API for wiring one store connection into the cache components.
//!
//! A `Connector` is constructed once at process start, shared by cloning, and
//! torn down once with [`Connector::shutdown`].

use std::sync::Arc;

use crate::client::CacheClient;
use crate::config::ConnectorConfig;
use crate::connection::ConnectionManager;
use crate::error::CacheError;
use crate::json::JsonCache;
use crate::metrics::MetricsSink;
use crate::rate_limit::RateLimiter;
use crate::session::SessionStore;
use crate::store::Transport;
use crate::stores::redis::RedisTransport;

/// Builder for a [`Connector`].
///
/// # Example
///
/// ```ignore
/// use kv_connector::{ConnectorBuilder, ConnectorConfig};
///
/// let connector = ConnectorBuilder::redis(ConnectorConfig::from_env()).build();
/// connector.connect().await?;
///
/// let sessions = connector.sessions();
/// sessions.set_session("abc", &login, None).await?;
///
/// connector.shutdown().await;
/// ```
pub struct ConnectorBuilder {
    transport: Arc<dyn Transport>,
    config: ConnectorConfig,
    sink: Option<Arc<dyn MetricsSink>>,
    session_ttl: Option<u64>,
}

impl ConnectorBuilder {
    /// Start from any transport, e.g. the in-process `MemoryTransport` in tests.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        ConnectorBuilder {
            transport,
            config: ConnectorConfig::default(),
            sink: None,
            session_ttl: None,
        }
    }

    /// Start from a Redis endpoint described by `config`.
    pub fn redis(config: ConnectorConfig) -> Self {
        let transport = Arc::new(RedisTransport::new(config.clone()));
        Self::new(transport).config(config)
    }

    /// Timeouts and retry policy for the connection manager.
    pub fn config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Report cache and rate-limit events to `sink`.
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Default lifetime for sessions stored without an explicit TTL.
    pub fn session_ttl(mut self, ttl_secs: u64) -> Self {
        self.session_ttl = Some(ttl_secs);
        self
    }

    /// Build the connector. Nothing is dialed until `connect`.
    pub fn build(self) -> Connector {
        let manager = ConnectionManager::new(self.transport, &self.config);
        let client = CacheClient::new(manager.clone());

        let mut json = JsonCache::new(client.clone());
        let mut rate_limiter = RateLimiter::new(client.clone());
        if let Some(sink) = &self.sink {
            json = json.with_metrics(Arc::clone(sink));
            rate_limiter = rate_limiter.with_metrics(Arc::clone(sink));
        }

        let mut sessions = SessionStore::new(json.clone());
        if let Some(ttl) = self.session_ttl {
            sessions = sessions.with_default_ttl(ttl);
        }

        Connector {
            manager,
            client,
            json,
            sessions,
            rate_limiter,
            sink: self.sink,
        }
    }
}

/// One store connection and the components layered on it.
#[derive(Clone)]
pub struct Connector {
    manager: ConnectionManager,
    client: CacheClient,
    json: JsonCache,
    sessions: SessionStore,
    rate_limiter: RateLimiter,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl Connector {
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn client(&self) -> CacheClient {
        self.client.clone()
    }

    pub fn json(&self) -> JsonCache {
        self.json.clone()
    }

    pub fn sessions(&self) -> SessionStore {
        self.sessions.clone()
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        self.rate_limiter.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    pub async fn connect(&self) -> Result<(), CacheError> {
        self.manager.connect().await
    }

    /// Close the connection and flush the metrics sink.
    pub async fn shutdown(&self) {
        if let Err(e) = self.manager.disconnect().await {
            tracing::warn!(error = %e, "error while closing connection");
        }

        if let Some(sink) = &self.sink
            && let Err(e) = sink.flush().await
        {
            tracing::warn!(error = %e, "failed to flush metrics");
        }

        tracing::info!(endpoint = self.manager.endpoint(), "connector shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::metrics::CacheEvent;
    use crate::metrics::testing::RecordingSink;
    use crate::stores::memory::MemoryTransport;
    use std::convert::Infallible;

    #[tokio::test]
    async fn test_components_share_one_connection() {
        let connector = ConnectorBuilder::new(Arc::new(MemoryTransport::new())).build();
        assert!(!connector.is_ready());

        connector.connect().await.unwrap();
        connector
            .sessions()
            .set_session("s1", &serde_json::json!({ "a": 1 }), None)
            .await
            .unwrap();
        connector
            .rate_limiter()
            .increment("scope", 60)
            .await
            .unwrap();

        let mut keys = connector.client().scan_prefix("").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ratelimit:scope", "session:s1"]);
    }

    #[tokio::test]
    async fn test_metrics_and_session_ttl_are_wired() {
        let sink = Arc::new(RecordingSink::default());
        let connector = ConnectorBuilder::new(Arc::new(MemoryTransport::new()))
            .metrics(sink.clone())
            .session_ttl(300)
            .build();
        connector.connect().await.unwrap();

        connector
            .json()
            .get_or_set("k", None, || async { Ok::<_, Infallible>(1u8) })
            .await
            .unwrap();
        connector.rate_limiter().check("s", 5, 60).await.unwrap();

        let events = sink.take();
        assert!(matches!(events[0], CacheEvent::Miss { .. }));
        assert!(matches!(events[1], CacheEvent::RateLimitAllowed { .. }));

        connector
            .sessions()
            .set_session("s", &1u8, None)
            .await
            .unwrap();
        let ttl = connector.sessions().session_ttl("s").await.unwrap();
        assert!(ttl.seconds().is_some_and(|s| s <= 300));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let connector = ConnectorBuilder::new(Arc::new(MemoryTransport::new())).build();
        connector.connect().await.unwrap();

        connector.shutdown().await;
        assert_eq!(connector.manager().state(), ConnectionState::Disconnected);
        assert!(matches!(
            connector.client().get("k").await,
            Err(CacheError::NotConnected)
        ));

        // Shutting down twice is harmless.
        connector.shutdown().await;
    }
}
