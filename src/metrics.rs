//! Metrics hooks for cache lookups and rate-limit decisions.
//!
//! Components accept an optional `MetricsSink` and emit a `CacheEvent` for every
//! observable outcome.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kv_connector::{CacheEvent, ConnectorBuilder, MemoryTransport, MetricsSink};
//!
//! let sink = Arc::new(MyMetricsSink::new());
//! let connector = ConnectorBuilder::new(Arc::new(MemoryTransport::new()))
//!     .metrics(sink.clone())
//!     .build();
//!
//! // get_or_set now reports Hit / Miss events to the sink
//! ```

use async_trait::async_trait;

/// Events emitted by the JSON cache and the rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// `get_or_set` found a cached value.
    Hit { key: String },
    /// `get_or_set` had to compute the value.
    Miss {
        key: String,
        /// Time spent in the compute function, in milliseconds.
        compute_ms: f64,
    },
    /// A cached document could not be decoded and was treated as a miss.
    DecodeFailure { key: String },
    /// A request was counted and allowed.
    RateLimitAllowed { scope: String, count: u64 },
    /// A request was counted and rejected.
    RateLimited { scope: String, count: u64 },
    /// The limiter could not reach the store and let the request through.
    FailOpen { scope: String, reason: String },
}

/// Trait for receiving connector events.
///
/// # Example
///
/// ```ignore
/// use std::sync::Mutex;
/// use async_trait::async_trait;
/// use kv_connector::{CacheEvent, MetricsSink};
///
/// struct BufferedSink {
///     buffer: Mutex<Vec<CacheEvent>>,
/// }
///
/// #[async_trait]
/// impl MetricsSink for BufferedSink {
///     fn emit(&self, event: CacheEvent) {
///         self.buffer.lock().unwrap().push(event);
///     }
/// }
/// ```
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Emit a single event.
    ///
    /// This is called synchronously in the hot path of cache operations.
    /// Implementations should be fast (e.g., buffer events in memory).
    fn emit(&self, event: CacheEvent);

    /// Flush any buffered events.
    ///
    /// Called at shutdown by `Connector::shutdown`.
    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}
