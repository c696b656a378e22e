//! Shared counter storage.
//!
//! All mutable rate limiting state lives behind [`CounterStore`]. The engine
//! itself holds nothing but read-only policies, so any number of limiter
//! instances, in any number of processes, can share one store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Errors raised by a counter store.
///
/// The limiter treats every variant the same way: the store is unavailable
/// and the policy's failure mode decides the request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Atomic counting primitives the limiter needs from a shared store.
///
/// Implementations must be safe for concurrent use from many tasks.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Atomically increment `key` and return the new count.
    ///
    /// A key that does not exist is created with count 1 and an expiry of
    /// `ttl`. Later increments must not touch the expiry; otherwise a caller
    /// that never pauses would keep its window open forever.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Read the current count of `key` without modifying it. Missing or
    /// expired keys read as zero.
    async fn count(&self, key: &str) -> Result<u64, StoreError>;

    /// Append an event at `now` to the log under `key`, drop entries at or
    /// before `now - window`, and return the number of entries left.
    async fn log_and_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError>;

    /// Count entries in the log under `key` newer than `now - window`,
    /// without modifying it.
    async fn log_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError>;
}

/// Lower bound (exclusive) of a sliding window ending at `now`, in epoch
/// milliseconds.
pub(crate) fn log_cutoff_millis(now: DateTime<Utc>, window: Duration) -> i64 {
    now.timestamp_millis() - window.as_millis() as i64
}
