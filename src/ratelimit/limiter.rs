//! The rate limiting decision engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::key::{CallerContext, CounterKey};
use super::policy::{Outcome, Policy, PolicySet};
use super::store::{CounterStore, StoreError};
use super::window::WindowStrategy;
use crate::error::{GatekeeperError, Result};

/// Default namespace prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "gatekeeper";
/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// The outcome of checking one policy for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Policy that produced this decision
    pub policy: String,
    /// Whether the request may proceed
    pub allowed: bool,
    /// Count observed in the store, including this request if it was counted
    pub current_count: u64,
    /// The policy's maximum
    pub limit: u64,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
    /// Whether `current_count` was read from the store. False for requests
    /// the policy does not count and for degraded decisions.
    #[serde(default)]
    pub observed: bool,
    /// Set when the store could not be consulted and the policy's failure
    /// mode decided instead
    #[serde(default)]
    pub degraded: bool,
}

impl Decision {
    /// Quota left in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count)
    }

    /// How long a rejected caller should wait, measured from `now`.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// The rate limiter engine.
///
/// Holds only read-only policies and handles to shared collaborators, so it
/// can be cloned freely and used from any number of tasks. All mutable state
/// lives in the [`CounterStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    policies: Arc<PolicySet>,
    key_prefix: String,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter over `store` with the system clock and defaults.
    pub fn new(store: Arc<dyn CounterStore>, policies: PolicySet) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            policies: Arc::new(policies),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the counter key namespace prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Replace the bound on each store round-trip.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn policy(&self, name: &str) -> Result<Arc<Policy>> {
        self.policies
            .get(name)
            .ok_or_else(|| GatekeeperError::UnknownPolicy(name.to_string()))
    }

    /// Pre-flight check: decide a request before it runs.
    ///
    /// Counts the request for `count_all` policies. Outcome-dependent
    /// policies are allowed without counting; use [`RateLimiter::check_only`]
    /// for a read-only view of them.
    pub async fn evaluate(&self, policy: &str, caller: &CallerContext) -> Result<Decision> {
        let policy = self.policy(policy)?;
        self.decide(&policy, caller, None).await
    }

    /// Post-hoc recording once the guarded operation's outcome is known.
    pub async fn record(
        &self,
        policy: &str,
        caller: &CallerContext,
        outcome: Outcome,
    ) -> Result<Decision> {
        let policy = self.policy(policy)?;
        self.decide(&policy, caller, Some(outcome)).await
    }

    /// Read-only check that never changes the stored count.
    ///
    /// `allowed` answers whether one more counted request would fit.
    pub async fn check_only(&self, policy: &str, caller: &CallerContext) -> Result<Decision> {
        let policy = self.policy(policy)?;
        let now = self.clock.now();
        let slot = policy.strategy().compute(now, policy.window());
        let key = self.counter_key(&policy, caller, slot.id)?;

        let result = match policy.strategy() {
            WindowStrategy::FixedWindow => self.bounded(self.store.count(&key)).await,
            WindowStrategy::SlidingLog => {
                self.bounded(self.store.log_count(&key, now, policy.window())).await
            }
        };

        Ok(match result {
            Ok(count) => Decision {
                policy: policy.name().to_string(),
                allowed: count < policy.max_count(),
                current_count: count,
                limit: policy.max_count(),
                reset_at: slot.reset_at,
                observed: true,
                degraded: false,
            },
            Err(err) => self.degraded(&policy, &key, slot.reset_at, err),
        })
    }

    /// Decide one request under one policy.
    ///
    /// `outcome` is `None` before the guarded operation runs. Requests whose
    /// outcome the policy does not count are allowed without touching the
    /// store. Store failures never escape: they become a degraded decision
    /// that follows the policy's failure mode. The only errors returned are
    /// caller contexts missing a component the key generator needs.
    pub async fn decide(
        &self,
        policy: &Policy,
        caller: &CallerContext,
        outcome: Option<Outcome>,
    ) -> Result<Decision> {
        let now = self.clock.now();
        let slot = policy.strategy().compute(now, policy.window());

        if !policy.counting_mode().counts(outcome) {
            trace!(policy = %policy.name(), ?outcome, "Outcome not counted by policy");
            return Ok(Decision {
                policy: policy.name().to_string(),
                allowed: true,
                current_count: 0,
                limit: policy.max_count(),
                reset_at: slot.reset_at,
                observed: false,
                degraded: false,
            });
        }

        let key = self.counter_key(policy, caller, slot.id)?;

        let result = match policy.strategy() {
            WindowStrategy::FixedWindow => self.bounded(self.store.increment(&key, slot.ttl)).await,
            WindowStrategy::SlidingLog => {
                self.bounded(self.store.log_and_count(&key, now, policy.window()))
                    .await
            }
        };

        let count = match result {
            Ok(count) => count,
            Err(err) => return Ok(self.degraded(policy, &key, slot.reset_at, err)),
        };

        let allowed = count <= policy.max_count();

        trace!(
            policy = %policy.name(),
            key = %key,
            count = count,
            limit = policy.max_count(),
            "Checked rate limit"
        );

        if !allowed {
            debug!(
                policy = %policy.name(),
                key = %key,
                count = count,
                limit = policy.max_count(),
                reset_at = %slot.reset_at,
                "Rate limit exceeded"
            );
        }

        Ok(Decision {
            policy: policy.name().to_string(),
            allowed,
            current_count: count,
            limit: policy.max_count(),
            reset_at: slot.reset_at,
            observed: true,
            degraded: false,
        })
    }

    fn counter_key(
        &self,
        policy: &Policy,
        caller: &CallerContext,
        window: Option<i64>,
    ) -> Result<String> {
        CounterKey::new(&self.key_prefix, policy.name(), policy.key_generator(), caller, window)
            .map(|key| key.to_string())
    }

    /// Run one store call under the configured timeout. No retries.
    async fn bounded<F>(&self, call: F) -> std::result::Result<u64, StoreError>
    where
        F: Future<Output = std::result::Result<u64, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    fn degraded(
        &self,
        policy: &Policy,
        key: &str,
        reset_at: DateTime<Utc>,
        err: StoreError,
    ) -> Decision {
        let allowed = policy.on_store_failure().allows();
        warn!(
            policy = %policy.name(),
            key = %key,
            error = %err,
            fail_open = allowed,
            "Counter store unavailable, applying failure mode"
        );
        Decision {
            policy: policy.name().to_string(),
            allowed,
            current_count: 0,
            limit: policy.max_count(),
            reset_at,
            observed: false,
            degraded: true,
        }
    }
}
