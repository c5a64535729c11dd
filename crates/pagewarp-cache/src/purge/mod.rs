//! Cross-process cache invalidation: the in-memory purge set, the purge
//! file writer/reader protocol, and the primitives they share.

mod context;
mod named_lock;
mod set;
mod shared_counter;

pub use context::{
    PurgeCallback, PurgeContext, PurgeContextOptions, UpdateCallback, CHECK_CACHE_INTERVAL_MS,
    LOCK_TIMEOUT_MS, MAX_CONTENTION_RETRIES, STEAL_LOCK_AFTER_MS,
};
pub use named_lock::{NamedLock, NamedLockGuard};
pub use set::{PurgeSet, CLOCK_SKEW_ALLOWANCE_MS, INITIAL_TIMESTAMP_MS};
pub use shared_counter::SharedCounter;
