//! Per-request policy composition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::ratelimit::{CallerContext, Decision, Outcome, RateLimiter};

/// Header names attached to responses.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Policy that denied the request
    pub policy: String,
    /// Message configured on that policy
    pub message: String,
    /// How long the caller should wait
    pub retry_after: Duration,
}

/// Aggregate result of every policy applied to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Decisions in evaluation order. Stops at the first denial.
    pub decisions: Vec<Decision>,
    /// Present when the request must be rejected
    pub rejection: Option<Rejection>,
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        self.rejection.is_none()
    }

    /// The decision closest to its limit, which is what clients should see.
    ///
    /// Only decisions backed by a store read take part.
    pub fn most_restrictive(&self) -> Option<&Decision> {
        self.decisions
            .iter()
            .filter(|d| d.observed)
            .min_by_key(|d| (d.allowed, d.remaining()))
    }

    /// Client-visible rate limit headers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let Some(decision) = self.most_restrictive() else {
            return Vec::new();
        };

        let mut headers = vec![
            (HEADER_LIMIT, decision.limit.to_string()),
            (HEADER_REMAINING, decision.remaining().to_string()),
            (HEADER_RESET, decision.reset_at.timestamp().to_string()),
        ];
        if let Some(rejection) = &self.rejection {
            // Round up so clients never retry a moment too early.
            let secs = rejection.retry_after.as_secs() + (rejection.retry_after.subsec_nanos() > 0) as u64;
            headers.push((HEADER_RETRY_AFTER, secs.to_string()));
        }
        headers
    }
}

/// The boundary adapter a web framework calls once per request.
///
/// Selects the policies assigned to a route and composes their decisions:
/// the first denial rejects the request and later policies are skipped.
/// Counts already taken by earlier policies are kept.
#[derive(Debug, Clone)]
pub struct RequestGuard {
    limiter: RateLimiter,
}

impl RequestGuard {
    /// Create a guard over a limiter.
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Decide whether a request to `route` may proceed.
    #[instrument(skip(self, caller))]
    pub async fn admit(&self, route: &str, caller: &CallerContext) -> Result<Verdict> {
        let policies = self.limiter.policies().for_route(route);
        let mut decisions = Vec::with_capacity(policies.len());

        for policy in policies {
            let decision = self.limiter.decide(policy, caller, None).await?;
            let allowed = decision.allowed;
            decisions.push(decision);

            if !allowed {
                let rejection = self.rejection(policy.name(), policy.rejection_message(), &decisions);
                info!(
                    route = %route,
                    policy = %policy.name(),
                    "Request rejected by rate limit"
                );
                return Ok(Verdict {
                    decisions,
                    rejection: Some(rejection),
                });
            }
        }

        debug!(route = %route, checked = decisions.len(), "Request admitted");
        Ok(Verdict {
            decisions,
            rejection: None,
        })
    }

    /// Report the outcome of a request that was admitted.
    ///
    /// Only policies that count outcomes are touched. The returned verdict
    /// says whether the caller has now exhausted any of them, which an
    /// application may use to lock out further attempts immediately.
    #[instrument(skip(self, caller))]
    pub async fn complete(
        &self,
        route: &str,
        caller: &CallerContext,
        outcome: Outcome,
    ) -> Result<Verdict> {
        let mut decisions = Vec::new();
        let mut rejection = None;

        for policy in self.limiter.policies().for_route(route) {
            if !policy.counting_mode().is_post_hoc() {
                continue;
            }
            let decision = self.limiter.decide(policy, caller, Some(outcome)).await?;
            let allowed = decision.allowed;
            decisions.push(decision);

            if !allowed && rejection.is_none() {
                rejection = Some(self.rejection(policy.name(), policy.rejection_message(), &decisions));
            }
        }

        Ok(Verdict {
            decisions,
            rejection,
        })
    }

    fn rejection(&self, policy: &str, message: &str, decisions: &[Decision]) -> Rejection {
        let now: DateTime<Utc> = self.limiter.clock().now();
        let retry_after = decisions
            .last()
            .map(|d| d.retry_after(now))
            .unwrap_or(Duration::ZERO);
        Rejection {
            policy: policy.to_string(),
            message: message.to_string(),
            retry_after,
        }
    }
}
