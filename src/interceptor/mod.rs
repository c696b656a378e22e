//! Boundary adapter between a host web framework and the limiter.
//!
//! The host calls [`RequestGuard::admit`] before handling a request and
//! [`RequestGuard::complete`] once the outcome is known, then translates a
//! rejection into its own protocol (for HTTP, a 429 carrying
//! [`Verdict::headers`]).

mod guard;

pub use guard::{
    RequestGuard, Rejection, Verdict, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
    HEADER_RETRY_AFTER,
};
