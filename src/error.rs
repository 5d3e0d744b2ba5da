use std::time::Duration;

/// Error type for connector operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// `connect()` did not reach the ready state before its deadline.
    #[error("connection to {endpoint} not ready within {timeout:?}")]
    ConnectionTimeout { endpoint: String, timeout: Duration },

    /// Reconnection attempts were used up. Fatal until the next explicit `connect()`.
    #[error("gave up connecting to {endpoint} after {attempts} attempts")]
    ConnectionExhausted { endpoint: String, attempts: u32 },

    /// An operation was attempted while the connection was not ready.
    #[error("store connection is not ready")]
    NotConnected,

    /// The transport reported that the live connection dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A command did not complete within the transport's command timeout.
    #[error("{op} timed out for key '{key}'")]
    Timeout { op: &'static str, key: String },

    /// A cached document could not be deserialized.
    #[error("failed to decode cached value for key '{key}': {message}")]
    Decode { key: String, message: String },

    /// Serialization of a value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other store-reported failure.
    #[error("[{store}] store error for key '{key}': {message}")]
    Transport {
        store: String,
        key: String,
        message: String,
    },
}

impl CacheError {
    /// Create a new transport error.
    pub fn transport(
        store: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Transport {
            store: store.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// True when the live link is gone and the manager should reconnect.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, CacheError::ConnectionLost(_))
    }

    /// True for every kind that means "the store cannot be used right now".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::NotConnected
                | CacheError::ConnectionLost(_)
                | CacheError::ConnectionExhausted { .. }
                | CacheError::ConnectionTimeout { .. }
                | CacheError::Timeout { .. }
        )
    }
}
