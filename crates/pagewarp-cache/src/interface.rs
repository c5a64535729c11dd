//! The cache interface contract shared by every backend and adapter.
//!
//! Every cache, whether a leaf backend, a wrapper, or a composer, speaks
//! the same callback-based protocol:
//!
//! - [`Cache::get`] invokes its callback exactly once with
//!   [`CacheLookup::Available`] or [`CacheLookup::NotFound`]. After
//!   [`Cache::shut_down`], any subsequent get reports not-found immediately.
//! - [`Cache::put`] and [`Cache::delete`] have no completion signal;
//!   visibility to later gets is best-effort and backend specific.
//! - [`Cache::is_blocking`] is true iff a get returns only after its callback
//!   has been invoked. A composite is blocking only if all of its
//!   sub-components are.
//! - Callbacks carry a caller-supplied validator
//!   ([`LookupCallback::validate_candidate`]) that can turn an available
//!   result into not-found without re-entering the cache.
//!
//! Failures never propagate as errors through this interface; they surface to
//! callers as not-found plus statistics counters.

use crate::value::SharedValue;

/// The outcome of a single-key lookup, as delivered to a callback.
///
/// Callers cannot distinguish a genuinely absent key from a purged,
/// shut-down, cancelled, or load-shed lookup; all of those report
/// [`CacheLookup::NotFound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The key was found and the value passed candidate validation.
    Available(SharedValue),
    /// The key is absent (or purged, cancelled, shed, or errored).
    NotFound,
}

impl CacheLookup {
    /// True iff the lookup produced a value.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// The value, if available.
    pub fn value(&self) -> Option<&SharedValue> {
        match self {
            Self::Available(value) => Some(value),
            Self::NotFound => None,
        }
    }
}

/// Receiver for the result of a [`Cache::get`] or [`Cache::multi_get`].
///
/// Implementations own their storage until [`LookupCallback::done`] is
/// invoked, which happens exactly once per accepted lookup.
pub trait LookupCallback: Send {
    /// Caller-supplied predicate run against any retrieved value before it is
    /// reported as available. Returning false converts the result to
    /// not-found without re-entering the cache. May be called from whichever
    /// thread completes the lookup.
    fn validate_candidate(&mut self, key: &str, value: &SharedValue) -> bool {
        let _ = (key, value);
        true
    }

    /// Deliver the final result. Invoked exactly once.
    fn done(self: Box<Self>, lookup: CacheLookup);
}

/// One key/callback pair of a multi-get request.
pub struct MultiGetRequest {
    /// The key to look up.
    pub key: String,
    /// Receiver for this key's result.
    pub callback: Box<dyn LookupCallback>,
}

impl MultiGetRequest {
    /// Bundle a key with its callback.
    pub fn new(key: impl Into<String>, callback: Box<dyn LookupCallback>) -> Self {
        Self {
            key: key.into(),
            callback,
        }
    }
}

/// Abstract cache: the uniform asynchronous key/value interface every
/// backend, wrapper, and composer implements.
pub trait Cache: Send + Sync {
    /// Identifying name, including the names of wrapped caches for
    /// composites, e.g. `WriteThrough(Lru, File)`.
    fn name(&self) -> String;

    /// Look up `key`, invoking `callback` exactly once.
    fn get(&self, key: &str, callback: Box<dyn LookupCallback>);

    /// Look up several keys at once. Each callback is invoked exactly once.
    /// The default implementation degrades to sequential gets; backends and
    /// adapters that can do better override it.
    fn multi_get(&self, requests: Vec<MultiGetRequest>) {
        for request in requests {
            self.get(&request.key, request.callback);
        }
    }

    /// Store `value` under `key`. No completion signal.
    fn put(&self, key: &str, value: SharedValue);

    /// Remove `key`. No completion signal.
    fn delete(&self, key: &str);

    /// True iff a get returns only after its callback has been invoked.
    fn is_blocking(&self) -> bool;

    /// Current health. Callers should skip puts and deletes against an
    /// unhealthy cache; gets still report not-found.
    fn is_healthy(&self) -> bool;

    /// Sticky shutdown: after this call, every subsequent get reports
    /// not-found immediately and puts/deletes are dropped.
    fn shut_down(&self);

    /// True iff this backend cannot verify a retrieved blob against its key
    /// and therefore requires callers to serialize the key into the value on
    /// put (see [`crate::codec`]). Composites wrapping such a backend mirror
    /// this property.
    fn must_encode_key_in_value(&self) -> bool {
        false
    }
}

/// A synchronous, single-threaded store such as the in-process LRU.
///
/// Stores do not implement [`Cache`] directly; they are served through
/// [`crate::compose::ThreadsafeCache`], which adds the mutex, the shutdown
/// flag, and the callback protocol.
pub trait BlockingStore: Send {
    /// Identifying name for composition in [`format_name`].
    fn name(&self) -> String;

    /// Look up `key`.
    fn get(&mut self, key: &str) -> Option<SharedValue>;

    /// Store `value` under `key`.
    fn put(&mut self, key: &str, value: SharedValue);

    /// Remove `key`.
    fn delete(&mut self, key: &str);
}

/// Run the callback's validator against an available result and deliver the
/// (possibly demoted) outcome. Every cache implementation reports lookups
/// through this helper so that validation happens uniformly, once, at the
/// layer that actually found the value.
pub fn validate_and_report(key: &str, mut callback: Box<dyn LookupCallback>, lookup: CacheLookup) {
    match lookup {
        CacheLookup::Available(value) => {
            if callback.validate_candidate(key, &value) {
                callback.done(CacheLookup::Available(value));
            } else {
                callback.done(CacheLookup::NotFound);
            }
        }
        CacheLookup::NotFound => callback.done(CacheLookup::NotFound),
    }
}

/// Compose a cache name from a wrapper name and its sub-caches, matching the
/// `Wrapper(a, b)` convention used throughout.
pub fn format_name(wrapper: &str, sub_names: &[&str]) -> String {
    format!("{}({})", wrapper, sub_names.join(", "))
}

mod blocking {
    use super::{Cache, CacheLookup, LookupCallback, SharedValue};
    use parking_lot::{Condvar, Mutex};
    use std::sync::Arc;

    #[derive(Default)]
    struct FetchState {
        result: Mutex<Option<CacheLookup>>,
        ready: Condvar,
    }

    /// A lookup callback that records its result and wakes a waiter.
    ///
    /// Used with blocking caches (the filesystem-metadata path) and in tests
    /// where the calling thread needs the value in hand before proceeding.
    pub struct BlockingFetch {
        state: Arc<FetchState>,
    }

    struct Waiter {
        state: Arc<FetchState>,
    }

    impl LookupCallback for Waiter {
        fn done(self: Box<Self>, lookup: CacheLookup) {
            let mut slot = self.state.result.lock();
            *slot = Some(lookup);
            self.state.ready.notify_all();
        }
    }

    impl BlockingFetch {
        /// Create a fetch whose callback can be handed to [`Cache::get`].
        pub fn new() -> Self {
            Self {
                state: Arc::new(FetchState::default()),
            }
        }

        /// The callback half; hand this to the cache.
        pub fn callback(&self) -> Box<dyn LookupCallback> {
            Box::new(Waiter {
                state: Arc::clone(&self.state),
            })
        }

        /// Block until the callback has been invoked, returning the result.
        pub fn wait(self) -> CacheLookup {
            let mut slot = self.state.result.lock();
            while slot.is_none() {
                self.state.ready.wait(&mut slot);
            }
            slot.take().unwrap_or(CacheLookup::NotFound)
        }
    }

    impl Default for BlockingFetch {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Synchronous get against a blocking cache.
    ///
    /// The target cache must declare [`Cache::is_blocking`]; calling this
    /// against a non-blocking cache is a programmer error and panics in
    /// debug builds (in release it would merely block until the worker pool
    /// serviced the lookup).
    pub fn blocking_get(cache: &dyn Cache, key: &str) -> Option<SharedValue> {
        debug_assert!(
            cache.is_blocking(),
            "blocking_get requires a blocking cache, got {}",
            cache.name()
        );
        let fetch = BlockingFetch::new();
        cache.get(key, fetch.callback());
        match fetch.wait() {
            CacheLookup::Available(value) => Some(value),
            CacheLookup::NotFound => None,
        }
    }
}

pub use blocking::{blocking_get, BlockingFetch};
