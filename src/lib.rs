//! kv-connector - a shared key-value store connector for caching, sessions and rate limiting
//!
//! This library provides:
//! - A managed connection with a connect timeout and backoff reconnection
//! - Primitive cache operations with optional expiration
//! - Typed JSON caching with a cache-aside `get_or_set` helper
//! - Session records under a `session:` namespace
//! - A fixed-window rate limiter and a tower middleware that fails open
//!
//! # Example
//!
//! ```ignore
//! use kv_connector::{ConnectorBuilder, ConnectorConfig, RateLimitConfig, RateLimitLayer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kv_connector::CacheError> {
//!     let connector = ConnectorBuilder::redis(ConnectorConfig::from_env()).build();
//!     connector.connect().await?;
//!
//!     // Cache-aside over any serde type
//!     let report = connector
//!         .json()
//!         .get_or_set("report:weekly", Some(300), || async {
//!             Ok::<_, std::io::Error>(build_report().await)
//!         })
//!         .await?;
//!
//!     // 100 requests per 15 minutes per client and path
//!     let layer = RateLimitLayer::new(connector.rate_limiter(), RateLimitConfig::default());
//!
//!     connector.shutdown().await;
//!     Ok(())
//! }
//! ```

mod builder;
mod client;
mod config;
mod connection;
mod error;
mod flight;
mod json;
pub mod metrics;
pub mod middleware;
mod rate_limit;
mod session;
mod store;
pub mod stores;
mod utils;

// Re-export public API
pub use builder::{Connector, ConnectorBuilder};
pub use client::CacheClient;
pub use config::{ConnectorConfig, DEFAULT_HOST, DEFAULT_PORT, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::CacheError;
pub use json::JsonCache;
pub use metrics::{CacheEvent, MetricsSink};
pub use middleware::{
    AuthenticatedIdentity, KeyGenerator, RateLimitConfig, RateLimitLayer, RateLimitService,
};
pub use rate_limit::{RATE_LIMIT_PREFIX, RateLimitDecision, RateLimiter};
pub use session::{DEFAULT_SESSION_TTL_SECS, SESSION_PREFIX, SessionStore};
pub use store::{KeyTtl, Store, Transport};
pub use stores::memory::{MemoryStore, MemoryTransport};
pub use stores::redis::{RedisStore, RedisTransport};
pub use utils::{namespaced_key, window_secs};
