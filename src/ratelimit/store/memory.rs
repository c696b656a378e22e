//! In-process counter store.
//!
//! Useful for tests and single-instance deployments. Per-key atomicity comes
//! from `DashMap`'s entry API, which holds the shard lock for the whole
//! read-modify-write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{log_cutoff_millis, CounterStore, StoreError};
use crate::ratelimit::clock::{epoch_millis, Clock, SystemClock};

#[derive(Debug, Clone)]
enum Slot {
    Counter { count: u64, expires_at: i64 },
    Log { entries: Vec<i64>, expires_at: i64 },
}

impl Slot {
    fn expires_at(&self) -> i64 {
        match self {
            Slot::Counter { expires_at, .. } | Slot::Log { expires_at, .. } => *expires_at,
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at() <= now_ms
    }
}

/// Counter store held in process memory.
///
/// Expiry is evaluated lazily against the injected clock, so tests driving a
/// [`ManualClock`](crate::ratelimit::ManualClock) see windows roll over
/// without sleeping.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    slots: Arc<DashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store using the given clock for expiry.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = epoch_millis(self.clock.now());
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now_ms));
        before - self.slots.len()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remaining time-to-live of a key, if it exists and has not expired.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now_ms = epoch_millis(self.clock.now());
        self.slots.get(key).and_then(|slot| {
            let left = slot.expires_at() - now_ms;
            (left > 0).then(|| Duration::from_millis(left as u64))
        })
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now_ms = epoch_millis(self.clock.now());
        let fresh = || Slot::Counter {
            count: 1,
            expires_at: now_ms + ttl.as_millis() as i64,
        };

        let count = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                match slot {
                    Slot::Counter { count, expires_at } if *expires_at > now_ms => {
                        *count += 1;
                        *count
                    }
                    _ => {
                        *slot = fresh();
                        1
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                1
            }
        };

        trace!(key = %key, count = count, "Incremented in-memory counter");
        Ok(count)
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let now_ms = epoch_millis(self.clock.now());
        Ok(match self.slots.get(key).as_deref() {
            Some(Slot::Counter { count, expires_at }) if *expires_at > now_ms => *count,
            _ => 0,
        })
    }

    async fn log_and_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let now_ms = epoch_millis(now);
        let cutoff = log_cutoff_millis(now, window);
        let expires_at = now_ms + window.as_millis() as i64;

        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot::Log {
            entries: Vec::new(),
            expires_at,
        });

        if !matches!(*slot, Slot::Log { .. }) {
            *slot = Slot::Log {
                entries: Vec::new(),
                expires_at,
            };
        }

        let Slot::Log {
            entries,
            expires_at: slot_expiry,
        } = &mut *slot
        else {
            return Err(StoreError::Protocol(format!("{} is not a log", key)));
        };

        entries.retain(|&ts| ts > cutoff);
        entries.push(now_ms);
        *slot_expiry = expires_at;
        Ok(entries.len() as u64)
    }

    async fn log_count(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = log_cutoff_millis(now, window);
        Ok(match self.slots.get(key).as_deref() {
            Some(Slot::Log { entries, .. }) => entries.iter().filter(|&&ts| ts > cutoff).count() as u64,
            _ => 0,
        })
    }
}
