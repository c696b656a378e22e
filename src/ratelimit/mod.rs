//! Rate limiting logic: windows, keys, policies, storage, and the engine.

mod clock;
mod key;
mod limiter;
mod policy;
mod store;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{CallerContext, CounterKey, KeyGenerator};
pub use limiter::{Decision, RateLimiter, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
pub use policy::{
    CountingMode, FailureMode, Outcome, Policy, PolicyBuilder, PolicyConfig, PolicyFile, PolicySet,
};
pub use store::{CounterStore, MemoryStore, StoreError};
#[cfg(feature = "redis-store")]
pub use store::{RedisStore, RedisStoreConfig};
pub use window::{TimeUnit, WindowSlot, WindowStrategy, MAX_WINDOW};
