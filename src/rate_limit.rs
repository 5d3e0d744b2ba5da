//! Fixed-window request counting under the `ratelimit:` namespace.
//!
//! Each scope owns one counter. The first hit in a window creates it at 1 and
//! sets its TTL to the window length in the same atomic store operation; later
//! hits only increment. When the TTL elapses the counter disappears and the next
//! hit starts a fresh window.

use std::sync::Arc;

use crate::client::CacheClient;
use crate::error::CacheError;
use crate::metrics::{CacheEvent, MetricsSink};
use crate::store::KeyTtl;
use crate::utils::namespaced_key;

/// Namespace for rate counters.
pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";

/// Outcome of counting one request against a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Counter value after this request.
    pub count: u64,
    pub limit: u64,
    /// `true` once `count` exceeds `limit`.
    pub limited: bool,
    /// Requests left in the window, floored at 0.
    pub remaining: u64,
    /// Seconds until the window resets. Only read from the store for limited requests.
    pub retry_after: Option<u64>,
}

/// Fixed-window rate limiter over the primitive operations.
#[derive(Clone)]
pub struct RateLimiter {
    client: CacheClient,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl RateLimiter {
    pub fn new(client: CacheClient) -> Self {
        RateLimiter { client, sink: None }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn key(scope: &str) -> String {
        namespaced_key(RATE_LIMIT_PREFIX, scope)
    }

    /// Count one request and return the counter value (always at least 1).
    pub async fn increment(&self, scope: &str, window_secs: u64) -> Result<u64, CacheError> {
        self.client
            .increment_with_expiry(&Self::key(scope), window_secs.max(1))
            .await
    }

    /// Count one request and report whether it exceeds `max_requests`.
    ///
    /// The increment is kept even when the request is limited, so rejected
    /// requests still count toward the window.
    pub async fn is_rate_limited(
        &self,
        scope: &str,
        max_requests: u64,
        window_secs: u64,
    ) -> Result<bool, CacheError> {
        let count = self.increment(scope, window_secs).await?;
        Ok(count > max_requests)
    }

    /// Like [`RateLimiter::is_rate_limited`], with the numbers needed for response headers.
    pub async fn check(
        &self,
        scope: &str,
        max_requests: u64,
        window_secs: u64,
    ) -> Result<RateLimitDecision, CacheError> {
        let count = self.increment(scope, window_secs).await?;
        let limited = count > max_requests;

        let retry_after = if limited {
            let ttl = self.client.ttl(&Self::key(scope)).await;
            Some(retry_after(scope, ttl, window_secs))
        } else {
            None
        };

        if limited {
            tracing::debug!(scope, count, max_requests, "rate limited");
            self.emit(CacheEvent::RateLimited {
                scope: scope.to_string(),
                count,
            });
        } else {
            self.emit(CacheEvent::RateLimitAllowed {
                scope: scope.to_string(),
                count,
            });
        }

        Ok(RateLimitDecision {
            count,
            limit: max_requests,
            limited,
            remaining: max_requests.saturating_sub(count),
            retry_after,
        })
    }

    /// Give back one request in the current window. Never creates a counter.
    pub async fn refund(&self, scope: &str) -> Result<(), CacheError> {
        let left = self.client.decrement_existing(&Self::key(scope)).await?;
        tracing::trace!(scope, left, "refunded request");
        Ok(())
    }

    /// Drop the counter, starting a fresh window on the next request.
    pub async fn reset(&self, scope: &str) -> Result<bool, CacheError> {
        let key = Self::key(scope);
        Ok(self.client.delete(&[key.as_str()]).await? > 0)
    }
}

/// Seconds until the window resets, read from the counter's TTL.
/// A failed TTL read falls back to the full window.
fn retry_after(scope: &str, ttl: Result<KeyTtl, CacheError>, window_secs: u64) -> u64 {
    match ttl {
        Ok(KeyTtl::Expires(secs)) => secs,
        // Expired between the two calls, or lost its TTL somehow.
        Ok(KeyTtl::Persistent | KeyTtl::Missing) => window_secs.max(1),
        Err(e) => {
            tracing::warn!(
                scope,
                error = %e,
                "could not read rate limit window, using full window"
            );
            window_secs.max(1)
        }
    }
}
