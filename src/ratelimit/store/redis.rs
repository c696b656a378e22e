//! Redis-backed counter store.
//!
//! Lets every service instance share rate limiting state through one Redis
//! deployment. Each operation is a single Lua script invocation, so the
//! read-modify-write happens atomically on the server:
//!
//! - Fixed windows: `INCR`, then `PEXPIRE` only when the key was just
//!   created. A key that somehow lost its expiry gets one again; a live
//!   expiry is never extended.
//! - Sliding logs: a sorted set scored by epoch milliseconds, trimmed to the
//!   window before adding the new entry and counting.
//!
//! Connections go through `redis::aio::ConnectionManager`, which reconnects
//! in the background. Cloning the manager is cheap and shares the
//! underlying connection.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::info;

use super::{log_cutoff_millis, CounterStore, StoreError};

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 or redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

const LOG_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return redis.call('ZCARD', KEYS[1])
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1/`
    pub url: String,
    /// How long to wait for the initial connection
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Counter store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    increment: Script,
    log: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `url` with default settings.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..RedisStoreConfig::default()
        })
        .await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the server cannot be
    /// reached within the connect timeout.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        let connection = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout))??;

        info!(url = %config.url, "Connected to Redis counter store");

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
            log: Script::new(LOG_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let count: u64 = self
            .increment
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: Option<u64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn log_and_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let now_ms = now.timestamp_millis();
        // Members must be unique or simultaneous events would collapse.
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
        let count: u64 = self
            .log
            .key(key)
            .arg(now_ms)
            .arg(log_cutoff_millis(now, window))
            .arg(window.as_millis().max(1) as u64)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn log_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let lower = format!("({}", log_cutoff_millis(now, window));
        let count: u64 = conn.zcount(key, lower, "+inf").await?;
        Ok(count)
    }
}
