//! Hit/miss/latency accounting around any cache.

use crate::interface::{format_name, Cache, CacheLookup, LookupCallback, MultiGetRequest};
use crate::stats::CacheCounters;
use crate::value::SharedValue;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use super::put_with_encoding;

/// Wraps a cache and tracks operation counts, byte volumes, and get
/// latency in a shared [`CacheCounters`] block.
pub struct StatsCache {
    backend: Arc<dyn Cache>,
    counters: Arc<CacheCounters>,
    /// The most recent put, kept so an immediately repeated identical
    /// put is not counted as a second cache fill.
    last_put: Mutex<Option<(String, SharedValue)>>,
}

impl StatsCache {
    pub fn new(backend: Arc<dyn Cache>) -> Self {
        Self::with_counters(backend, Arc::new(CacheCounters::default()))
    }

    /// Share a counter block, e.g. to aggregate several shards under one
    /// statistics name.
    pub fn with_counters(backend: Arc<dyn Cache>, counters: Arc<CacheCounters>) -> Self {
        Self {
            backend,
            counters,
            last_put: Mutex::new(None),
        }
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    fn is_repeat_put(&self, key: &str, value: &SharedValue) -> bool {
        let mut last = self.last_put.lock();
        let repeat = matches!(
            &*last,
            Some((k, v)) if k == key && v.as_bytes() == value.as_bytes()
        );
        if !repeat {
            *last = Some((key.to_string(), value.clone()));
        }
        repeat
    }
}

struct TimedCallback {
    counters: Arc<CacheCounters>,
    start: Instant,
    inner: Box<dyn LookupCallback>,
}

impl TimedCallback {
    fn new(counters: &Arc<CacheCounters>, inner: Box<dyn LookupCallback>) -> Box<Self> {
        Box::new(Self {
            counters: Arc::clone(counters),
            start: Instant::now(),
            inner,
        })
    }
}

impl LookupCallback for TimedCallback {
    fn validate_candidate(&mut self, key: &str, value: &SharedValue) -> bool {
        self.inner.validate_candidate(key, value)
    }

    fn done(self: Box<Self>, lookup: CacheLookup) {
        self.counters.get_latency.record(self.start.elapsed());
        match &lookup {
            CacheLookup::Available(value) => {
                self.counters.hits.add(1);
                self.counters.hit_bytes.add(value.len() as u64);
            }
            CacheLookup::NotFound => self.counters.misses.add(1),
        }
        self.inner.done(lookup);
    }
}

impl Cache for StatsCache {
    fn name(&self) -> String {
        format_name("Stats", &[&self.backend.name()])
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        self.backend
            .get(key, TimedCallback::new(&self.counters, callback));
    }

    fn multi_get(&self, requests: Vec<MultiGetRequest>) {
        let timed = requests
            .into_iter()
            .map(|request| MultiGetRequest {
                key: request.key,
                callback: TimedCallback::new(&self.counters, request.callback) as Box<_>,
            })
            .collect();
        self.backend.multi_get(timed);
    }

    fn put(&self, key: &str, value: SharedValue) {
        if !self.is_repeat_put(key, &value) {
            self.counters.inserts.add(1);
            self.counters.insert_bytes.add(value.len() as u64);
            self.counters.insert_size.record_bytes(value.len());
        }
        put_with_encoding(self.backend.as_ref(), key, value);
    }

    fn delete(&self, key: &str) {
        self.counters.deletes.add(1);
        self.backend.delete(key);
    }

    fn is_blocking(&self) -> bool {
        self.backend.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.backend.is_healthy()
    }

    fn shut_down(&self) {
        self.backend.shut_down();
    }
}
