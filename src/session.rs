//! Session records under the `session:` namespace.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::CacheError;
use crate::json::JsonCache;
use crate::store::KeyTtl;
use crate::utils::namespaced_key;

/// Namespace for session keys.
pub const SESSION_PREFIX: &str = "session:";

/// Default session lifetime: one day.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;

/// Ephemeral per-user state stored as JSON at `session:<id>`.
#[derive(Clone)]
pub struct SessionStore {
    json: JsonCache,
    default_ttl: u64,
}

impl SessionStore {
    pub fn new(json: JsonCache) -> Self {
        SessionStore {
            json,
            default_ttl: DEFAULT_SESSION_TTL_SECS,
        }
    }

    /// Override the lifetime used when `set_session` gets no TTL.
    pub fn with_default_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl = ttl_secs;
        self
    }

    fn key(session_id: &str) -> String {
        namespaced_key(SESSION_PREFIX, session_id)
    }

    /// Create or replace a session. `ttl_secs` falls back to the store default.
    pub async fn set_session<T>(
        &self,
        session_id: &str,
        data: &T,
        ttl_secs: Option<u64>,
    ) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let ttl = ttl_secs.unwrap_or(self.default_ttl);
        self.json
            .cache_json(&Self::key(session_id), data, Some(ttl))
            .await?;
        tracing::debug!(session_id, ttl, "session stored");
        Ok(())
    }

    /// Load a session. Missing and undecodable records both read as `None`.
    pub async fn get_session<T>(&self, session_id: &str) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        self.json.get_cached_json(&Self::key(session_id)).await
    }

    /// Remove a session. Returns `true` if one existed.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, CacheError> {
        let key = Self::key(session_id);
        let removed = self.json.client().delete(&[key.as_str()]).await?;
        tracing::debug!(session_id, removed, "session deleted");
        Ok(removed > 0)
    }

    /// Extend the lifetime of an existing session. Returns `false` if it does not exist.
    pub async fn touch_session(
        &self,
        session_id: &str,
        ttl_secs: Option<u64>,
    ) -> Result<bool, CacheError> {
        let ttl = ttl_secs.unwrap_or(self.default_ttl);
        self.json
            .client()
            .expire(&Self::key(session_id), ttl)
            .await
    }

    pub async fn session_ttl(&self, session_id: &str) -> Result<KeyTtl, CacheError> {
        self.json.client().ttl(&Self::key(session_id)).await
    }
}
