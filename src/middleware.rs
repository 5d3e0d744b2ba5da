//! Tower middleware enforcing fixed-window quotas per request scope.
//!
//! The scope of a request is `<path>:<key>`, where the key comes from the
//! configured [`KeyGenerator`] (by default the authenticated identity, then the
//! client IP). The layer fails open: if the store cannot be reached the request
//! goes through unthrottled and without rate-limit headers.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post};
//! use kv_connector::{RateLimitConfig, RateLimitLayer};
//!
//! let login_limit = RateLimitConfig::new(15 * 60 * 1000, 5)
//!     .message("Too many login attempts, please try again later.")
//!     .skip_successful_requests(true);
//!
//! let app = Router::new()
//!     .route("/api/login", post(login))
//!     .layer(RateLimitLayer::new(connector.rate_limiter(), login_limit));
//! ```

use axum::extract::ConnectInfo;
use http::header::{self, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Request, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::connection::ConnectionState;
use crate::error::CacheError;
use crate::metrics::CacheEvent;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::utils::window_secs;

/// `X-RateLimit-Limit` response header.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining` response header.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Identity of the authenticated caller, inserted as a request extension by
/// the authentication layer. Preferred over the client address when present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticatedIdentity(pub String);

/// Derives the per-client part of the rate-limit scope from a request.
pub type KeyGenerator = Arc<dyn Fn(&Parts) -> String + Send + Sync>;

/// Default key: authenticated identity, then socket address, then the first
/// `X-Forwarded-For` hop, then `unknown`.
pub fn default_key(parts: &Parts) -> String {
    if let Some(AuthenticatedIdentity(id)) = parts.extensions.get::<AuthenticatedIdentity>() {
        return id.clone();
    }

    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    if let Some(hop) = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        && !hop.is_empty()
    {
        return hop.to_string();
    }

    "unknown".to_string()
}

/// Rate limiting configuration for one layer.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Window length in milliseconds; rounded up to whole seconds.
    pub window_ms: u64,
    /// Requests allowed per window and scope.
    pub max_requests: u64,
    /// Message placed in the 429 body.
    pub message: Option<String>,
    /// Refund requests answered with a 2xx or 3xx status.
    pub skip_successful_requests: bool,
    /// Refund requests answered with a status of 400 or above, or failing outright.
    pub skip_failed_requests: bool,
    pub key_generator: Option<KeyGenerator>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 15 * 60 * 1000, // 15 minutes
            max_requests: 100,
            message: None,
            skip_successful_requests: false,
            skip_failed_requests: false,
            key_generator: None,
        }
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("message", &self.message)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .field("key_generator", &self.key_generator.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl RateLimitConfig {
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            ..Self::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    fn key_for(&self, parts: &Parts) -> String {
        match &self.key_generator {
            Some(generator) => generator(parts),
            None => default_key(parts),
        }
    }

    fn should_refund(&self, status: StatusCode) -> bool {
        if status.is_success() || status.is_redirection() {
            self.skip_successful_requests
        } else if status.is_client_error() || status.is_server_error() {
            self.skip_failed_requests
        } else {
            false
        }
    }
}

/// Layer that applies a [`RateLimitConfig`] to every request.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
    config: Arc<RateLimitConfig>,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter, config: RateLimitConfig) -> Self {
        RateLimitLayer {
            limiter,
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: RateLimiter,
    config: Arc<RateLimitConfig>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let limiter = self.limiter.clone();
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let scope = format!("{}:{}", parts.uri.path(), config.key_for(&parts));
            let req = Request::from_parts(parts, body);

            let Some(decision) = admit(&limiter, &config, &scope).await else {
                return inner.call(req).await;
            };

            if decision.limited {
                return Ok(too_many_requests(&config, &decision));
            }

            let mut response = match inner.call(req).await {
                Ok(response) => response,
                Err(e) => {
                    if config.skip_failed_requests {
                        refund(&limiter, &scope).await;
                    }
                    return Err(e);
                }
            };

            if config.should_refund(response.status()) {
                refund(&limiter, &scope).await;
            }

            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
            Ok(response)
        })
    }
}

/// Count the request, or return `None` to let it through unthrottled.
///
/// Never waits on a dial loop: while one is running the request goes straight
/// through, otherwise a single dial attempt is made.
async fn admit(
    limiter: &RateLimiter,
    config: &RateLimitConfig,
    scope: &str,
) -> Option<RateLimitDecision> {
    let manager = limiter.client().manager();
    let connected = match manager.state() {
        ConnectionState::Ready => Ok(()),
        ConnectionState::Connecting | ConnectionState::Reconnecting => {
            Err(CacheError::NotConnected)
        }
        ConnectionState::Disconnected | ConnectionState::Closed => manager.try_connect().await,
    };
    if let Err(e) = connected {
        fail_open(limiter, scope, &e);
        return None;
    }

    match limiter
        .check(scope, config.max_requests, window_secs(config.window_ms))
        .await
    {
        Ok(decision) => Some(decision),
        Err(e) => {
            fail_open(limiter, scope, &e);
            None
        }
    }
}

fn fail_open(limiter: &RateLimiter, scope: &str, err: &CacheError) {
    if err.is_unavailable() {
        tracing::warn!(scope, error = %err, "rate limiter unavailable, allowing request");
    } else {
        tracing::error!(scope, error = %err, "rate limit check failed, allowing request");
    }
    limiter.emit(CacheEvent::FailOpen {
        scope: scope.to_string(),
        reason: err.to_string(),
    });
}

async fn refund(limiter: &RateLimiter, scope: &str) {
    if let Err(e) = limiter.refund(scope).await {
        tracing::warn!(scope, error = %e, "failed to refund skipped request");
    }
}

fn too_many_requests<B: From<String>>(
    config: &RateLimitConfig,
    decision: &RateLimitDecision,
) -> Response<B> {
    let retry_after = decision.retry_after.unwrap_or_else(|| window_secs(config.window_ms));
    let body = serde_json::json!({
        "error": "Too many requests",
        "message": config.message.as_deref().unwrap_or(DEFAULT_MESSAGE),
        "retryAfter": retry_after,
    });

    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
