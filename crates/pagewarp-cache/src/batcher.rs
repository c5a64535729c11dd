//! Lookup coalescing and batching above a non-blocking cache.
//!
//! The batcher keeps at most `max_parallel_lookups` lookup groups in
//! flight against the underlying cache. Concurrent gets for a key that is
//! already in flight or queued join that key's waiter list instead of
//! issuing another backend call. Keys that arrive while the group budget
//! is spent accumulate in a queue; when a group completes, the whole
//! queue is dispatched as one multi-get. Gets beyond `max_pending_gets`
//! are shed with an immediate not-found.

use crate::interface::{
    format_name, validate_and_report, Cache, CacheLookup, LookupCallback, MultiGetRequest,
};
use crate::stats::{BatcherStats, UpDownCounter};
use crate::value::SharedValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default bound on concurrent lookup groups.
pub const DEFAULT_MAX_PARALLEL_LOOKUPS: usize = 1;
/// Default bound on waiters (in flight plus queued) before shedding.
pub const DEFAULT_MAX_PENDING_GETS: usize = 1000;

struct BatcherState {
    /// Waiters per key currently dispatched to the underlying cache.
    in_flight: HashMap<String, Vec<Box<dyn LookupCallback>>>,
    /// Waiters per key awaiting the next batch.
    queued: HashMap<String, Vec<Box<dyn LookupCallback>>>,
    num_in_flight_groups: usize,
    /// Total waiters across both maps.
    num_pending_gets: usize,
    shutdown: bool,
}

struct BatcherInner {
    backend: Arc<dyn Cache>,
    state: Mutex<BatcherState>,
    stats: BatcherStats,
    /// Key count of the most recent multi-get batch; -1 until one is sent.
    last_batch_size: UpDownCounter,
    max_parallel_lookups: usize,
    max_pending_gets: usize,
}

/// Shares one underlying lookup among all concurrent gets of a key and
/// collapses backlogged keys into multi-get batches.
pub struct CacheBatcher {
    inner: Arc<BatcherInner>,
}

/// Completion of one key within a dispatched group.
struct GroupCallback {
    key: String,
    inner: Arc<BatcherInner>,
    /// Keys of the group not yet completed.
    remaining: Arc<AtomicUsize>,
}

impl LookupCallback for GroupCallback {
    // Validation belongs to the individual waiters, which may disagree;
    // the shared lookup accepts everything.
    fn done(self: Box<Self>, lookup: CacheLookup) {
        self.inner.group_key_done(&self.key, &self.remaining, lookup);
    }
}

impl BatcherInner {
    fn dispatch_single(self: &Arc<Self>, key: String) {
        let remaining = Arc::new(AtomicUsize::new(1));
        let callback = Box::new(GroupCallback {
            key: key.clone(),
            inner: Arc::clone(self),
            remaining,
        });
        self.backend.get(&key, callback);
    }

    fn dispatch_batch(self: &Arc<Self>, keys: Vec<String>) {
        let remaining = Arc::new(AtomicUsize::new(keys.len()));
        let requests = keys
            .into_iter()
            .map(|key| {
                let callback = Box::new(GroupCallback {
                    key: key.clone(),
                    inner: Arc::clone(self),
                    remaining: Arc::clone(&remaining),
                });
                MultiGetRequest::new(key, callback as Box<dyn LookupCallback>)
            })
            .collect();
        self.backend.multi_get(requests);
    }

    fn group_key_done(
        self: &Arc<Self>,
        key: &str,
        remaining: &Arc<AtomicUsize>,
        lookup: CacheLookup,
    ) {
        let mut next_batch: Option<Vec<String>> = None;
        let waiters = {
            let mut state = self.state.lock();
            let waiters = state.in_flight.remove(key).unwrap_or_default();
            state.num_pending_gets -= waiters.len();
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                state.num_in_flight_groups -= 1;
                if !state.queued.is_empty()
                    && state.num_in_flight_groups < self.max_parallel_lookups
                {
                    let batch: HashMap<String, Vec<Box<dyn LookupCallback>>> =
                        std::mem::take(&mut state.queued);
                    let mut keys = Vec::with_capacity(batch.len());
                    for (key, callbacks) in batch {
                        keys.push(key.clone());
                        state.in_flight.insert(key, callbacks);
                    }
                    state.num_in_flight_groups += 1;
                    self.last_batch_size.set(keys.len() as i64);
                    next_batch = Some(keys);
                }
            }
            waiters
        };
        for waiter in waiters {
            validate_and_report(key, waiter, lookup.clone());
        }
        if let Some(keys) = next_batch {
            self.dispatch_batch(keys);
        }
    }
}

impl CacheBatcher {
    /// Wrap `backend` with the default parallelism and queue bounds.
    pub fn new(backend: Arc<dyn Cache>) -> Self {
        Self::with_limits(
            backend,
            DEFAULT_MAX_PARALLEL_LOOKUPS,
            DEFAULT_MAX_PENDING_GETS,
        )
    }

    pub fn with_limits(
        backend: Arc<dyn Cache>,
        max_parallel_lookups: usize,
        max_pending_gets: usize,
    ) -> Self {
        let inner = Arc::new(BatcherInner {
            backend,
            state: Mutex::new(BatcherState {
                in_flight: HashMap::new(),
                queued: HashMap::new(),
                num_in_flight_groups: 0,
                num_pending_gets: 0,
                shutdown: false,
            }),
            stats: BatcherStats::default(),
            last_batch_size: UpDownCounter::default(),
            max_parallel_lookups,
            max_pending_gets,
        });
        inner.last_batch_size.set(-1);
        Self { inner }
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.inner.stats
    }

    /// Waiters in flight plus queued.
    pub fn pending_gets(&self) -> usize {
        self.inner.state.lock().num_pending_gets
    }

    /// Key count of the most recent batched multi-get, -1 before the
    /// first batch.
    pub fn last_batch_size(&self) -> i64 {
        self.inner.last_batch_size.get()
    }
}

enum Admission {
    /// Rejected; the callback completes not-found on the calling thread.
    Shed(Box<dyn LookupCallback>),
    Absorbed,
    Dispatch,
}

impl Cache for CacheBatcher {
    fn name(&self) -> String {
        format_name("Batcher", &[&self.inner.backend.name()])
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        let admission = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                Admission::Shed(callback)
            } else if state.num_pending_gets >= self.inner.max_pending_gets {
                self.inner.stats.dropped_gets.add(1);
                Admission::Shed(callback)
            } else if let Some(waiters) = state.in_flight.get_mut(key) {
                waiters.push(callback);
                state.num_pending_gets += 1;
                self.inner.stats.coalesced_gets.add(1);
                Admission::Absorbed
            } else if let Some(waiters) = state.queued.get_mut(key) {
                waiters.push(callback);
                state.num_pending_gets += 1;
                self.inner.stats.coalesced_gets.add(1);
                Admission::Absorbed
            } else if state.num_in_flight_groups < self.inner.max_parallel_lookups {
                state.in_flight.insert(key.to_string(), vec![callback]);
                state.num_pending_gets += 1;
                state.num_in_flight_groups += 1;
                Admission::Dispatch
            } else {
                state.queued.insert(key.to_string(), vec![callback]);
                state.num_pending_gets += 1;
                self.inner.stats.queued_gets.add(1);
                Admission::Absorbed
            }
        };
        match admission {
            Admission::Shed(callback) => callback.done(CacheLookup::NotFound),
            Admission::Dispatch => self.inner.dispatch_single(key.to_string()),
            Admission::Absorbed => {}
        }
    }

    fn put(&self, key: &str, value: SharedValue) {
        self.inner.backend.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.inner.backend.delete(key);
    }

    fn is_blocking(&self) -> bool {
        self.inner.backend.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        !self.inner.state.lock().shutdown && self.inner.backend.is_healthy()
    }

    fn shut_down(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.backend.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CheckingFetch, DelayCache};

    fn delayed_batcher() -> (CacheBatcher, Arc<DelayCache>) {
        let backend = Arc::new(DelayCache::new());
        (CacheBatcher::new(backend.clone() as Arc<dyn Cache>), backend)
    }

    #[test]
    fn test_concurrent_gets_share_one_lookup() {
        let (batcher, backend) = delayed_batcher();
        backend.put("k", SharedValue::from("v"));
        backend.delay_key("k");
        let fetches: Vec<CheckingFetch> = (0..4).map(|_| CheckingFetch::new()).collect();
        for fetch in &fetches {
            batcher.get("k", fetch.callback());
        }
        assert_eq!(backend.num_gets(), 1);
        assert_eq!(batcher.pending_gets(), 4);
        assert_eq!(batcher.stats().coalesced_gets.get(), 3);

        backend.release("k");
        for fetch in &fetches {
            assert_eq!(
                fetch.wait().value().map(SharedValue::to_string_lossy),
                Some("v".to_string())
            );
        }
        assert_eq!(batcher.pending_gets(), 0);
        assert_eq!(backend.num_gets(), 1);
    }

    #[test]
    fn test_backlog_dispatches_as_one_batch() {
        let (batcher, backend) = delayed_batcher();
        backend.put("k1", SharedValue::from("a"));
        backend.put("k2", SharedValue::from("b"));
        backend.put("k3", SharedValue::from("c"));
        backend.delay_key("k1");

        let f1 = CheckingFetch::new();
        let f2 = CheckingFetch::new();
        let f2b = CheckingFetch::new();
        let f3 = CheckingFetch::new();
        batcher.get("k1", f1.callback());
        // The single in-flight slot is taken; these queue for the batch.
        batcher.get("k2", f2.callback());
        batcher.get("k3", f3.callback());
        batcher.get("k2", f2b.callback());
        assert_eq!(batcher.stats().queued_gets.get(), 2);
        assert_eq!(batcher.stats().coalesced_gets.get(), 1);
        assert_eq!(batcher.last_batch_size(), -1);

        backend.release("k1");
        assert!(f1.wait().is_available());
        assert!(f2.wait().is_available());
        assert!(f2b.wait().is_available());
        assert!(f3.wait().is_available());
        assert_eq!(batcher.last_batch_size(), 2);
        assert_eq!(backend.batch_sizes(), vec![2]);
        assert_eq!(batcher.pending_gets(), 0);
    }

    #[test]
    fn test_pending_bound_sheds_gets() {
        let backend = Arc::new(DelayCache::new());
        let batcher =
            CacheBatcher::with_limits(backend.clone() as Arc<dyn Cache>, 1, 2);
        backend.delay_key("k");
        let f1 = CheckingFetch::new();
        let f2 = CheckingFetch::new();
        let shed = CheckingFetch::new();
        batcher.get("k", f1.callback());
        batcher.get("k", f2.callback());
        batcher.get("k", shed.callback());
        assert!(shed.done(), "shed get completes on the calling thread");
        assert!(shed.wait().value().is_none());
        assert_eq!(batcher.stats().dropped_gets.get(), 1);
        backend.release("k");
        assert!(f1.wait().value().is_none());
        assert!(f2.wait().value().is_none());
    }

    #[test]
    fn test_waiters_validate_independently() {
        let (batcher, backend) = delayed_batcher();
        backend.put("k", SharedValue::from("maybe"));
        backend.delay_key("k");
        let trusting = CheckingFetch::new();
        let doubting = CheckingFetch::with_invalid_value("maybe");
        batcher.get("k", trusting.callback());
        batcher.get("k", doubting.callback());
        backend.release("k");
        assert!(trusting.wait().is_available());
        assert!(doubting.wait().value().is_none());
    }

    #[test]
    fn test_put_and_delete_pass_through() {
        let (batcher, backend) = delayed_batcher();
        batcher.put("k", SharedValue::from("v"));
        let fetch = CheckingFetch::new();
        batcher.get("k", fetch.callback());
        assert!(fetch.wait().is_available());
        batcher.delete("k");
        let gone = CheckingFetch::new();
        batcher.get("k", gone.callback());
        assert!(gone.wait().value().is_none());
        assert_eq!(backend.num_gets(), 2);
    }

    #[test]
    fn test_shutdown_rejects_new_gets_but_drains_in_flight() {
        let (batcher, backend) = delayed_batcher();
        backend.put("k", SharedValue::from("v"));
        backend.delay_key("k");
        let in_flight = CheckingFetch::new();
        batcher.get("k", in_flight.callback());
        batcher.shut_down();
        assert!(!batcher.is_healthy());

        let rejected = CheckingFetch::new();
        batcher.get("k", rejected.callback());
        assert!(rejected.done());
        assert!(rejected.wait().value().is_none());

        backend.release("k");
        assert!(in_flight.wait().is_available());
        assert_eq!(batcher.pending_gets(), 0);
    }

    #[test]
    fn test_name() {
        let (batcher, _backend) = delayed_batcher();
        assert_eq!(batcher.name(), "Batcher(Delay)");
    }

    #[test]
    fn test_coalescing_full_stack() {
        let backend = Arc::new(DelayCache::new());
        backend.put("n0", SharedValue::from("v0"));
        backend.put("n1", SharedValue::from("v1"));
        backend.put("n2", SharedValue::from("v2"));
        let stats = Arc::new(crate::compose::StatsCache::new(
            backend.clone() as Arc<dyn Cache>,
        ));
        let batcher = CacheBatcher::new(stats.clone() as Arc<dyn Cache>);

        backend.delay_key("n0");
        let f_n0 = CheckingFetch::new();
        let f_n1 = CheckingFetch::new();
        let f_miss1 = CheckingFetch::new();
        let f_n2 = CheckingFetch::new();
        let f_miss2 = CheckingFetch::new();
        let f_n1b = CheckingFetch::new();
        batcher.get("n0", f_n0.callback());
        batcher.get("n1", f_n1.callback());
        batcher.get("not_found", f_miss1.callback());
        batcher.get("n2", f_n2.callback());
        batcher.get("not_found", f_miss2.callback());
        batcher.get("n1", f_n1b.callback());

        backend.release("n0");
        assert_eq!(
            f_n0.wait().value().map(SharedValue::to_string_lossy),
            Some("v0".to_string())
        );
        assert_eq!(
            f_n1.wait().value().map(SharedValue::to_string_lossy),
            Some("v1".to_string())
        );
        assert_eq!(
            f_n1b.wait().value().map(SharedValue::to_string_lossy),
            Some("v1".to_string())
        );
        assert_eq!(
            f_n2.wait().value().map(SharedValue::to_string_lossy),
            Some("v2".to_string())
        );
        assert!(f_miss1.wait().value().is_none());
        assert!(f_miss2.wait().value().is_none());

        // One direct lookup for n0 plus the three keys of the single
        // dispatched batch; the two coalesced gets never reach the backend.
        assert_eq!(backend.num_gets(), 4);
        assert_eq!(backend.batch_sizes(), vec![3]);
        assert_eq!(batcher.last_batch_size(), 3);
        // The backend answered each distinct key once.
        assert_eq!(stats.counters().hits.get(), 3);
        assert_eq!(stats.counters().misses.get(), 1);
    }

    #[test]
    fn test_load_shedding_full_stack() {
        let backend = Arc::new(DelayCache::new());
        backend.put("n0", SharedValue::from("v0"));
        backend.put("n1", SharedValue::from("v1"));
        backend.put("n2", SharedValue::from("v2"));
        backend.put("n3", SharedValue::from("v3"));
        let batcher = CacheBatcher::with_limits(backend.clone() as Arc<dyn Cache>, 1, 4);

        backend.delay_key("n0");
        let f_n0 = CheckingFetch::new();
        let f_n1 = CheckingFetch::new();
        let f_miss = CheckingFetch::new();
        let f_n2 = CheckingFetch::new();
        let f_n3 = CheckingFetch::new();
        batcher.get("n0", f_n0.callback());
        batcher.get("n1", f_n1.callback());
        batcher.get("not_found", f_miss.callback());
        batcher.get("n2", f_n2.callback());
        batcher.get("n3", f_n3.callback());

        // The fifth get finds the queue at its bound and is shed at once.
        assert!(f_n3.done());
        assert!(f_n3.wait().value().is_none());
        assert_eq!(batcher.stats().dropped_gets.get(), 1);

        backend.release("n0");
        assert_eq!(
            f_n0.wait().value().map(SharedValue::to_string_lossy),
            Some("v0".to_string())
        );
        assert_eq!(
            f_n1.wait().value().map(SharedValue::to_string_lossy),
            Some("v1".to_string())
        );
        assert!(f_miss.wait().value().is_none());
        assert_eq!(
            f_n2.wait().value().map(SharedValue::to_string_lossy),
            Some("v2".to_string())
        );
        assert_eq!(batcher.pending_gets(), 0);
    }
}
