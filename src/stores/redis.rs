use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::config::ConnectorConfig;
use crate::error::CacheError;
use crate::store::{KeyTtl, Store, Transport};
use crate::utils::escape_glob;

/// INCR, and set the window TTL only when this call created the counter.
static INCREMENT_WITH_EXPIRY: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#,
    )
});

/// DECR only if the counter still exists, so a refund never creates a key without a TTL.
static DECREMENT_EXISTING: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('DECR', KEYS[1])
end
return 0
"#,
    )
});

const SCAN_BATCH: usize = 250;

/// Dials Redis with redis-rs and hands out multiplexed connection handles.
pub struct RedisTransport {
    config: ConnectorConfig,
}

impl RedisTransport {
    /// Create a transport for the given configuration.
    ///
    /// No connection is made until the connection manager calls `open`.
    ///
    /// # Example
    /// ```ignore
    /// let transport = RedisTransport::new(ConnectorConfig::from_env());
    /// let manager = ConnectionManager::new(Arc::new(transport), &config);
    /// ```
    pub fn new(config: ConnectorConfig) -> Self {
        RedisTransport { config }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    async fn open(&self) -> Result<Arc<dyn Store>, CacheError> {
        let client = redis::Client::open(self.config.url().as_str()).map_err(|e| {
            CacheError::transport("redis", "", format!("invalid connection settings: {}", e))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| classify("CONNECT", "", e))?;

        let store = RedisStore {
            connection,
            command_timeout: self.config.command_timeout,
            closed: AtomicBool::new(false),
        };
        store.ping().await?;

        Ok(Arc::new(store))
    }
}

/// A live Redis connection.
///
/// Every command runs under the configured command timeout.
pub struct RedisStore {
    connection: MultiplexedConnection,
    command_timeout: Duration,
    closed: AtomicBool,
}

impl RedisStore {
    async fn run<T, F>(&self, op: &'static str, key: &str, command: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::ConnectionLost("connection closed".to_string()));
        }

        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(op, key, e)),
            Err(_) => Err(CacheError::Timeout {
                op,
                key: key.to_string(),
            }),
        }
    }
}

/// Sort a redis-rs error into the connector's taxonomy.
fn classify(op: &'static str, key: &str, err: RedisError) -> CacheError {
    if err.is_timeout() {
        CacheError::Timeout {
            op,
            key: key.to_string(),
        }
    } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        CacheError::ConnectionLost(format!("{} failed: {}", op, err))
    } else {
        CacheError::transport("redis", key, format!("{} failed: {}", op, err))
    }
}

#[async_trait]
impl Store for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: String = self
            .run("PING", "", async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        self.run("GET", key, conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        match ttl_secs {
            Some(ttl) => {
                let _: () = self.run("SETEX", key, conn.set_ex(key, value, ttl)).await?;
            }
            None => {
                let _: () = self.run("SET", key, conn.set(key, value)).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let joined = keys.join(",");
        self.run("DEL", &joined, conn.del(keys.to_vec())).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        self.run("EXISTS", key, conn.exists(key)).await
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        self.run("EXPIRE", key, conn.expire(key, secs)).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let mut conn = self.connection.clone();
        let reply: i64 = self.run("TTL", key, conn.ttl(key)).await?;
        Ok(KeyTtl::from_reply(reply))
    }

    async fn increment_with_expiry(&self, key: &str, window_secs: u64) -> Result<u64, CacheError> {
        let mut conn = self.connection.clone();
        let count: i64 = self
            .run("INCR", key, async move {
                INCREMENT_WITH_EXPIRY
                    .key(key)
                    .arg(window_secs)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        u64::try_from(count).map_err(|_| {
            CacheError::transport("redis", key, format!("counter went negative: {}", count))
        })
    }

    async fn decrement_existing(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        self.run("DECR", key, async move {
            DECREMENT_EXISTING.key(key).invoke_async(&mut conn).await
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let mut conn = self.connection.clone();
            let pattern = pattern.as_str();
            let (next, batch): (u64, Vec<String>) = self
                .run("SCAN", prefix, async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn close(&self) -> Result<(), CacheError> {
        // The multiplexed connection shuts down once the last clone is dropped.
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
