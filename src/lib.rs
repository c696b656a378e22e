//! Gatekeeper - Distributed Request Rate Limiting
//!
//! This crate decides, per named policy, whether a caller may make another
//! request within a time window. Counters live in a shared store (Redis in
//! production) so every instance of a service enforces the same quotas.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gatekeeper::interceptor::RequestGuard;
//! use gatekeeper::ratelimit::{CallerContext, MemoryStore, PolicySet, RateLimiter};
//!
//! # async fn run() -> gatekeeper::error::Result<()> {
//! let policies = PolicySet::from_file("policies.yaml")?;
//! let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), policies);
//! let guard = RequestGuard::new(limiter);
//!
//! let caller = CallerContext::from_addr("203.0.113.9".parse().unwrap());
//! let verdict = guard.admit("/auth/login", &caller).await?;
//! if !verdict.allowed() {
//!     // reply 429 with verdict.headers()
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod interceptor;
pub mod ratelimit;
