//! Shared helpers for cache tests.

use crate::interface::{
    validate_and_report, Cache, CacheLookup, LookupCallback, MultiGetRequest,
};
use crate::value::SharedValue;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct FetchState {
    result: Mutex<Option<CacheLookup>>,
    ready: Condvar,
}

/// A test callback that records its result, optionally rejecting one
/// specific value through the validator hook.
pub struct CheckingFetch {
    state: Arc<FetchState>,
    invalid_value: Option<Vec<u8>>,
    validations: Arc<AtomicU64>,
}

struct CheckingCallback {
    state: Arc<FetchState>,
    invalid_value: Option<Vec<u8>>,
    validations: Arc<AtomicU64>,
}

impl LookupCallback for CheckingCallback {
    fn validate_candidate(&mut self, _key: &str, value: &SharedValue) -> bool {
        self.validations.fetch_add(1, Ordering::SeqCst);
        self.invalid_value.as_deref() != Some(value.as_bytes())
    }

    fn done(self: Box<Self>, lookup: CacheLookup) {
        let mut slot = self.state.result.lock();
        *slot = Some(lookup);
        self.state.ready.notify_all();
    }
}

impl CheckingFetch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FetchState::default()),
            invalid_value: None,
            validations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Like [`CheckingFetch::new`], but the validator rejects candidates
    /// whose bytes equal `value`.
    pub fn with_invalid_value(value: &str) -> Self {
        let mut fetch = Self::new();
        fetch.invalid_value = Some(value.as_bytes().to_vec());
        fetch
    }

    /// The callback half; hand this to a cache.
    pub fn callback(&self) -> Box<dyn LookupCallback> {
        Box::new(CheckingCallback {
            state: Arc::clone(&self.state),
            invalid_value: self.invalid_value.clone(),
            validations: Arc::clone(&self.validations),
        })
    }

    /// True once the callback has run.
    pub fn done(&self) -> bool {
        self.state.result.lock().is_some()
    }

    /// Block until the callback has run and return the result.
    pub fn wait(&self) -> CacheLookup {
        let mut slot = self.state.result.lock();
        while slot.is_none() {
            self.state.ready.wait(&mut slot);
        }
        slot.clone().unwrap_or(CacheLookup::NotFound)
    }

    /// Number of times the validator ran.
    pub fn validations(&self) -> u64 {
        self.validations.load(Ordering::SeqCst)
    }
}

impl Default for CheckingFetch {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-memory cache whose lookups can be held back per key and released
/// later, for exercising coalescing, batching, and cancellation paths.
/// Lookups on non-delayed keys complete synchronously.
pub struct DelayCache {
    store: Mutex<HashMap<String, SharedValue>>,
    delayed: Mutex<HashMap<String, Vec<Box<dyn LookupCallback>>>>,
    shutdown: AtomicBool,
    num_gets: AtomicU64,
    multi_get_batches: Mutex<Vec<usize>>,
}

impl DelayCache {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            delayed: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            num_gets: AtomicU64::new(0),
            multi_get_batches: Mutex::new(Vec::new()),
        }
    }

    /// Hold back lookups on `key` until [`DelayCache::release`].
    pub fn delay_key(&self, key: &str) {
        self.delayed.lock().entry(key.to_string()).or_default();
    }

    /// Complete all held lookups on `key` against the current contents.
    pub fn release(&self, key: &str) {
        let callbacks = self.delayed.lock().remove(key).unwrap_or_default();
        let value = self.store.lock().get(key).cloned();
        for callback in callbacks {
            let lookup = value
                .clone()
                .map_or(CacheLookup::NotFound, CacheLookup::Available);
            validate_and_report(key, callback, lookup);
        }
    }

    /// Total single keys looked up, across gets and multi-gets.
    pub fn num_gets(&self) -> u64 {
        self.num_gets.load(Ordering::SeqCst)
    }

    /// Key counts of the multi-get batches received, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.multi_get_batches.lock().clone()
    }

    fn lookup(&self, key: &str, callback: Box<dyn LookupCallback>) {
        self.num_gets.fetch_add(1, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            callback.done(CacheLookup::NotFound);
            return;
        }
        let mut delayed = self.delayed.lock();
        if let Some(queue) = delayed.get_mut(key) {
            queue.push(callback);
            return;
        }
        drop(delayed);
        let lookup = self
            .store
            .lock()
            .get(key)
            .cloned()
            .map_or(CacheLookup::NotFound, CacheLookup::Available);
        validate_and_report(key, callback, lookup);
    }
}

impl Default for DelayCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for DelayCache {
    fn name(&self) -> String {
        "Delay".to_string()
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        self.lookup(key, callback);
    }

    fn multi_get(&self, requests: Vec<MultiGetRequest>) {
        self.multi_get_batches.lock().push(requests.len());
        for request in requests {
            self.lookup(&request.key, request.callback);
        }
    }

    fn put(&self, key: &str, value: SharedValue) {
        if !self.shutdown.load(Ordering::SeqCst) {
            self.store.lock().insert(key.to_string(), value);
        }
    }

    fn delete(&self, key: &str) {
        self.store.lock().remove(key);
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
