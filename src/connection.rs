//! Lifecycle of the single shared store connection.
//!
//! `ConnectionManager` owns the one live `Store` handle. Callers never queue
//! behind it: `handle()` either returns the live handle or fails fast.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ConnectorConfig, RetryPolicy};
use crate::error::CacheError;
use crate::store::{Store, Transport};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Reconnecting,
    /// Retries were exhausted. Only an explicit `connect()` leaves this state.
    Closed,
}

/// What the watch channel publishes: state plus the handle that goes with it.
#[derive(Clone)]
struct Link {
    state: ConnectionState,
    handle: Option<Arc<dyn Store>>,
}

impl Link {
    fn at(state: ConnectionState) -> Self {
        Link {
            state,
            handle: None,
        }
    }
}

/// Outcome of the last dial loop that ran to completion.
struct DialRecord {
    generation: u64,
    attempts: u32,
    outcome: Result<(), CacheError>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    endpoint: String,
    connect_timeout: Duration,
    retry: RetryPolicy,
    link: watch::Sender<Link>,
    /// Serializes dial loops started by `connect()`.
    dial_lock: Mutex<()>,
    /// Written only while `dial_lock` is held.
    last_dial: parking_lot::Mutex<DialRecord>,
    reconnect_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Owns the single logical connection to the store.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager for `transport`. Nothing is dialed until `connect()`.
    pub fn new(transport: Arc<dyn Transport>, config: &ConnectorConfig) -> Self {
        let (link, _) = watch::channel(Link::at(ConnectionState::Disconnected));
        ConnectionManager {
            inner: Arc::new(Inner {
                endpoint: transport.endpoint(),
                transport,
                connect_timeout: config.connect_timeout,
                retry: config.retry,
                link,
                dial_lock: Mutex::new(()),
                last_dial: parking_lot::Mutex::new(DialRecord {
                    generation: 0,
                    attempts: 0,
                    outcome: Ok(()),
                }),
                reconnect_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.link.borrow().state
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Endpoint the transport dials, without credentials.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Return the live store handle.
    ///
    /// Fails with `NotConnected` unless the state is `Ready`, or with
    /// `ConnectionExhausted` once reconnection gave up.
    pub fn handle(&self) -> Result<Arc<dyn Store>, CacheError> {
        let link = self.inner.link.borrow();
        match (link.state, &link.handle) {
            (ConnectionState::Ready, Some(store)) => Ok(Arc::clone(store)),
            (ConnectionState::Closed, _) => Err(self.exhausted()),
            _ => Err(CacheError::NotConnected),
        }
    }

    /// Connect to the store, waiting at most the configured connect timeout.
    ///
    /// Idempotent: returns immediately when already ready. Failed dials are retried
    /// on the backoff schedule inside the deadline. Callers that arrive while
    /// another full dial loop runs wait for it and share its failure instead of
    /// dialing again.
    pub async fn connect(&self) -> Result<(), CacheError> {
        self.connect_with(self.inner.retry.max_attempts, ConnectionState::Closed)
            .await
    }

    /// Make a single dial attempt, without backoff.
    ///
    /// On failure the state goes back to `Disconnected` and the dial error is
    /// returned. From `Closed` the state stays `Closed`.
    pub async fn try_connect(&self) -> Result<(), CacheError> {
        let on_failure = match self.state() {
            ConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        };
        self.connect_with(1, on_failure).await
    }

    async fn connect_with(
        &self,
        attempts: u32,
        on_failure: ConnectionState,
    ) -> Result<(), CacheError> {
        if self.is_ready() {
            return Ok(());
        }

        let deadline = Instant::now() + self.inner.connect_timeout;
        self.establish(attempts, on_failure, deadline).await
    }

    async fn establish(
        &self,
        attempts: u32,
        on_failure: ConnectionState,
        deadline: Instant,
    ) -> Result<(), CacheError> {
        // A reconnect is already in flight: wait for its outcome rather than dial twice.
        if self.state() == ConnectionState::Reconnecting {
            match tokio::time::timeout_at(deadline, self.settle_reconnect()).await {
                Ok(ConnectionState::Ready) => return Ok(()),
                Ok(ConnectionState::Closed) => return Err(self.exhausted()),
                Ok(_) => {}
                Err(_) => return Err(self.timed_out()),
            }
        }

        let seen = self.inner.last_dial.lock().generation;
        let Ok(_dialing) = tokio::time::timeout_at(deadline, self.inner.dial_lock.lock()).await
        else {
            return Err(self.timed_out());
        };
        if self.is_ready() {
            return Ok(());
        }
        {
            let last = self.inner.last_dial.lock();
            if last.generation != seen
                && last.attempts >= attempts
                && let Err(e) = &last.outcome
            {
                return Err(e.clone());
            }
        }

        self.cancel_reconnect();
        self.inner
            .link
            .send_replace(Link::at(ConnectionState::Connecting));
        tracing::debug!(endpoint = %self.inner.endpoint, attempts, "connecting to store");

        let dialing = tokio::time::timeout_at(deadline, self.dial(attempts, on_failure));
        let finished = match dialing.await {
            Ok(finished) => finished,
            Err(_) => {
                if self.leave(ConnectionState::Connecting, ConnectionState::Disconnected) {
                    let timeout = self.inner.connect_timeout;
                    tracing::warn!(
                        endpoint = %self.inner.endpoint,
                        ?timeout,
                        "store connection timed out"
                    );
                    Some(Err(self.timed_out()))
                } else {
                    None
                }
            }
        };

        // `None` means `disconnect()` ran mid-dial; its outcome is not shared.
        let Some(outcome) = finished else {
            return Err(CacheError::NotConnected);
        };
        let mut last = self.inner.last_dial.lock();
        last.generation += 1;
        last.attempts = attempts;
        last.outcome = outcome.clone();
        outcome
    }

    /// Run up to `attempts` dials. Returns `None` when the state stopped being
    /// `Connecting` underneath the loop.
    async fn dial(
        &self,
        attempts: u32,
        on_failure: ConnectionState,
    ) -> Option<Result<(), CacheError>> {
        let retry = self.inner.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.transport.open().await {
                Ok(store) => {
                    if !self.publish_ready(ConnectionState::Connecting, &store) {
                        tracing::debug!(
                            endpoint = %self.inner.endpoint,
                            "dial superseded by disconnect"
                        );
                        let _ = store.close().await;
                        return None;
                    }
                    tracing::info!(
                        endpoint = %self.inner.endpoint,
                        attempt,
                        "store connection ready"
                    );
                    return Some(Ok(()));
                }
                Err(e) if attempt >= attempts => {
                    if !self.leave(ConnectionState::Connecting, on_failure) {
                        return None;
                    }
                    if on_failure != ConnectionState::Closed {
                        tracing::warn!(
                            endpoint = %self.inner.endpoint,
                            error = %e,
                            "store connect attempt failed"
                        );
                        return Some(Err(e));
                    }
                    tracing::error!(
                        endpoint = %self.inner.endpoint,
                        attempts = attempt,
                        error = %e,
                        "giving up connecting to store"
                    );
                    return Some(Err(self.exhausted()));
                }
                Err(e) => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        endpoint = %self.inner.endpoint,
                        attempt,
                        ?delay,
                        error = %e,
                        "store connect attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.state() != ConnectionState::Connecting {
                        return None;
                    }
                }
            }
        }
    }

    /// Wait until a running reconnect settles and return the resulting state.
    async fn settle_reconnect(&self) -> ConnectionState {
        let mut rx = self.inner.link.subscribe();
        match rx
            .wait_for(|link| link.state != ConnectionState::Reconnecting)
            .await
        {
            Ok(link) => link.state,
            Err(_) => ConnectionState::Disconnected,
        }
    }

    /// Wait until the manager reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.inner.link.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|link| link.state == target).await;
    }

    /// Gracefully close the connection. No-op when not connected.
    ///
    /// A dial still in flight is abandoned: its handle is closed instead of
    /// being published.
    pub async fn disconnect(&self) -> Result<(), CacheError> {
        self.cancel_reconnect();
        let previous = self
            .inner
            .link
            .send_replace(Link::at(ConnectionState::Disconnected));

        match previous.handle {
            Some(store) => {
                tracing::info!(endpoint = %self.inner.endpoint, "disconnecting from store");
                store.close().await
            }
            None => Ok(()),
        }
    }

    /// Report that `failed` lost its link. Starts the reconnect loop once per dead handle.
    pub(crate) fn connection_lost(&self, failed: &Arc<dyn Store>, reason: &str) {
        let failed_ptr = Arc::as_ptr(failed) as *const ();
        let lost = self.inner.link.send_if_modified(|link| match &link.handle {
            Some(live)
                if link.state == ConnectionState::Ready
                    && Arc::as_ptr(live) as *const () == failed_ptr =>
            {
                *link = Link::at(ConnectionState::Reconnecting);
                true
            }
            _ => false,
        });

        if lost {
            tracing::warn!(
                endpoint = %self.inner.endpoint,
                reason,
                "store connection lost, reconnecting"
            );
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(&self) {
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.reconnect_loop().await });
        let previous = self.inner.reconnect_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_reconnect(&self) {
        let task = self.inner.reconnect_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn reconnect_loop(&self) {
        let retry = self.inner.retry;
        for attempt in 1..=retry.max_attempts {
            tokio::time::sleep(retry.delay_for(attempt)).await;
            if self.state() != ConnectionState::Reconnecting {
                return;
            }

            match tokio::time::timeout(self.inner.connect_timeout, self.inner.transport.open())
                .await
            {
                Ok(Ok(store)) => {
                    if self.publish_ready(ConnectionState::Reconnecting, &store) {
                        tracing::info!(
                            endpoint = %self.inner.endpoint,
                            attempt,
                            "store connection restored"
                        );
                    } else {
                        let _ = store.close().await;
                    }
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        endpoint = %self.inner.endpoint,
                        attempt,
                        error = %e,
                        "reconnect attempt failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        endpoint = %self.inner.endpoint,
                        attempt,
                        "reconnect attempt timed out"
                    );
                }
            }
        }

        if self.leave(ConnectionState::Reconnecting, ConnectionState::Closed) {
            tracing::error!(
                endpoint = %self.inner.endpoint,
                attempts = retry.max_attempts,
                "reconnect attempts exhausted, connection closed"
            );
        }
    }

    /// Publish `store` as the live handle, but only if the state is still `from`.
    fn publish_ready(&self, from: ConnectionState, store: &Arc<dyn Store>) -> bool {
        self.inner.link.send_if_modified(|link| {
            if link.state == from {
                *link = Link {
                    state: ConnectionState::Ready,
                    handle: Some(Arc::clone(store)),
                };
                true
            } else {
                false
            }
        })
    }

    /// Move from `from` to `to`. Returns false if the state had already moved on.
    fn leave(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.inner.link.send_if_modified(|link| {
            if link.state == from {
                *link = Link::at(to);
                true
            } else {
                false
            }
        })
    }

    fn timed_out(&self) -> CacheError {
        CacheError::ConnectionTimeout {
            endpoint: self.inner.endpoint.clone(),
            timeout: self.inner.connect_timeout,
        }
    }

    fn exhausted(&self) -> CacheError {
        CacheError::ConnectionExhausted {
            endpoint: self.inner.endpoint.clone(),
            attempts: self.inner.retry.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryTransport;

    fn manager_for(transport: &MemoryTransport) -> ConnectionManager {
        ConnectionManager::new(Arc::new(transport.clone()), &ConnectorConfig::default())
    }

    #[tokio::test]
    async fn test_handle_fails_fast_before_connect() {
        let transport = MemoryTransport::new();
        let manager = manager_for(&transport);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_ready());
        assert!(matches!(manager.handle(), Err(CacheError::NotConnected)));
        assert_eq!(transport.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = MemoryTransport::new();
        let manager = manager_for(&transport);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert!(manager.is_ready());
        assert!(manager.handle().is_ok());
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_dial_once() {
        let transport = MemoryTransport::new();
        transport.set_dial_delay(Some(Duration::from_millis(20)));
        let manager = manager_for(&transport);

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let transport = MemoryTransport::new();
        transport.set_dial_delay(Some(Duration::from_secs(30)));
        let manager = manager_for(&transport);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::ConnectionTimeout { timeout, .. } if timeout == Duration::from_secs(5)
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausts_retries() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);
        let manager = manager_for(&transport);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, CacheError::ConnectionExhausted { attempts: 10, .. }));
        assert_eq!(transport.dial_count(), 10);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(
            manager.handle(),
            Err(CacheError::ConnectionExhausted { .. })
        ));

        // An explicit connect leaves the closed state.
        transport.set_reachable(true);
        manager.connect().await.unwrap();
        assert!(manager.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_failed_dial_loop() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);
        let manager = manager_for(&transport);

        let started = Instant::now();
        let results = futures::future::join_all((0..4).map(|_| manager.connect())).await;

        for result in results {
            assert!(matches!(result, Err(CacheError::ConnectionExhausted { attempts: 10, .. })));
        }
        assert_eq!(transport.dial_count(), 10);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_try_connect_dials_once() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);
        let manager = manager_for(&transport);

        let err = manager.try_connect().await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(transport.dial_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // A failed single attempt does not mask a later one.
        let err = manager.try_connect().await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(transport.dial_count(), 2);

        transport.set_reachable(true);
        manager.try_connect().await.unwrap();
        assert!(manager.is_ready());
        assert_eq!(transport.dial_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_connect_keeps_closed_state() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);
        let manager = manager_for(&transport);
        manager.connect().await.unwrap_err();
        assert_eq!(manager.state(), ConnectionState::Closed);

        manager.try_connect().await.unwrap_err();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(transport.dial_count(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_abandons_inflight_connect() {
        let transport = MemoryTransport::new();
        transport.set_dial_delay(Some(Duration::from_millis(100)));
        let manager = manager_for(&transport);

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.disconnect().await.unwrap();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(CacheError::NotConnected)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(manager.handle(), Err(CacheError::NotConnected)));

        // The abandoned dial does not short-circuit the next connect.
        manager.connect().await.unwrap();
        assert!(manager.is_ready());
        assert_eq!(transport.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_lost_link() {
        let transport = MemoryTransport::new();
        let manager = manager_for(&transport);
        manager.connect().await.unwrap();

        let handle = manager.handle().unwrap();
        transport.sever();
        let err = handle.get("k").await.unwrap_err();
        manager.connection_lost(&handle, &err.to_string());
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(matches!(manager.handle(), Err(CacheError::NotConnected)));

        // A second report about the same dead handle is ignored.
        manager.connection_lost(&handle, "again");

        manager.wait_for_state(ConnectionState::Ready).await;
        let fresh = manager.handle().unwrap();
        assert!(fresh.ping().await.is_ok());
        assert_eq!(transport.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_and_closes() {
        let transport = MemoryTransport::new();
        let manager = manager_for(&transport);
        manager.connect().await.unwrap();

        let handle = manager.handle().unwrap();
        transport.set_reachable(false);
        manager.connection_lost(&handle, "reset");

        manager.wait_for_state(ConnectionState::Closed).await;
        assert_eq!(transport.dial_count(), 11);
        assert!(matches!(
            manager.handle(),
            Err(CacheError::ConnectionExhausted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_running_reconnect() {
        let transport = MemoryTransport::new();
        let manager = manager_for(&transport);
        manager.connect().await.unwrap();

        let handle = manager.handle().unwrap();
        transport.sever();
        manager.connection_lost(&handle, "reset");

        manager.connect().await.unwrap();
        assert!(manager.is_ready());
        assert_eq!(transport.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = MemoryTransport::new();
        let manager = manager_for(&transport);

        manager.disconnect().await.unwrap();
        manager.connect().await.unwrap();
        let handle = manager.handle().unwrap();

        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(handle.ping().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_reconnect() {
        let transport = MemoryTransport::new();
        let manager = manager_for(&transport);
        manager.connect().await.unwrap();

        let handle = manager.handle().unwrap();
        transport.set_reachable(false);
        manager.connection_lost(&handle, "reset");
        manager.disconnect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
