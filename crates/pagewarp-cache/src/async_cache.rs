//! Non-blocking adapter: funnels every operation on a blocking backend
//! through one bounded sequence of the shared worker pool.
//!
//! Because the sequence runs one task at a time, the backend is only ever
//! touched by one thread, so non-thread-safe backends behind a
//! [`crate::compose::ThreadsafeCache`] gain parallel callers without
//! extra locking on the hot path.

use crate::codec::encode_key_in_value;
use crate::interface::{format_name, Cache, CacheLookup, LookupCallback, MultiGetRequest};
use crate::sequencer::{task_only, Sequence, SequenceTask, WorkerPool};
use crate::stats::UpDownCounter;
use crate::value::SharedValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Queue depth after which the oldest pending operations are retired:
/// gets complete not-found, puts and deletes are dropped.
const MAX_QUEUE_SIZE: usize = 500;

pub struct AsyncCache {
    backend: Arc<dyn Cache>,
    sequence: Arc<Sequence>,
    shutdown: Arc<AtomicBool>,
    outstanding: Arc<UpDownCounter>,
}

struct GetTask {
    key: String,
    backend: Arc<dyn Cache>,
    shutdown: Arc<AtomicBool>,
    outstanding: Arc<UpDownCounter>,
    callback: Box<dyn LookupCallback>,
}

impl SequenceTask for GetTask {
    fn run(self: Box<Self>) {
        self.outstanding.add(-1);
        if self.shutdown.load(Ordering::SeqCst) {
            self.callback.done(CacheLookup::NotFound);
        } else {
            self.backend.get(&self.key, self.callback);
        }
    }

    fn cancel(self: Box<Self>) {
        self.outstanding.add(-1);
        self.callback.done(CacheLookup::NotFound);
    }
}

struct MultiGetTask {
    requests: Vec<MultiGetRequest>,
    backend: Arc<dyn Cache>,
    shutdown: Arc<AtomicBool>,
    outstanding: Arc<UpDownCounter>,
}

impl SequenceTask for MultiGetTask {
    fn run(self: Box<Self>) {
        self.outstanding.add(-1);
        if self.shutdown.load(Ordering::SeqCst) {
            for request in self.requests {
                request.callback.done(CacheLookup::NotFound);
            }
        } else {
            self.backend.multi_get(self.requests);
        }
    }

    fn cancel(self: Box<Self>) {
        self.outstanding.add(-1);
        for request in self.requests {
            request.callback.done(CacheLookup::NotFound);
        }
    }
}

impl AsyncCache {
    /// Wrap `backend`, drawing one sequence from `pool`.
    pub fn new(backend: Arc<dyn Cache>, pool: &WorkerPool) -> Self {
        let sequence = pool.new_sequence();
        sequence.set_max_queue_size(MAX_QUEUE_SIZE);
        Self {
            backend,
            sequence,
            shutdown: Arc::new(AtomicBool::new(false)),
            outstanding: Arc::new(UpDownCounter::default()),
        }
    }

    /// Operations enqueued but not yet handed to the backend.
    pub fn outstanding_operations(&self) -> i64 {
        self.outstanding.get()
    }
}

impl Cache for AsyncCache {
    fn name(&self) -> String {
        format_name("Async", &[&self.backend.name()])
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        if self.shutdown.load(Ordering::SeqCst) {
            callback.done(CacheLookup::NotFound);
            return;
        }
        self.outstanding.add(1);
        self.sequence.add(Box::new(GetTask {
            key: key.to_string(),
            backend: Arc::clone(&self.backend),
            shutdown: Arc::clone(&self.shutdown),
            outstanding: Arc::clone(&self.outstanding),
            callback,
        }));
    }

    fn multi_get(&self, requests: Vec<MultiGetRequest>) {
        if self.shutdown.load(Ordering::SeqCst) {
            for request in requests {
                request.callback.done(CacheLookup::NotFound);
            }
            return;
        }
        self.outstanding.add(1);
        self.sequence.add(Box::new(MultiGetTask {
            requests,
            backend: Arc::clone(&self.backend),
            shutdown: Arc::clone(&self.shutdown),
            outstanding: Arc::clone(&self.outstanding),
        }));
    }

    fn put(&self, key: &str, value: SharedValue) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        // Values are shared copy-on-write blobs, so any rewrite has to
        // happen here on the calling thread, not on a pool thread.
        let value = if self.backend.must_encode_key_in_value() {
            encode_key_in_value(key, &value)
        } else {
            value
        };
        let backend = Arc::clone(&self.backend);
        let key = key.to_string();
        self.sequence.add(task_only(move || {
            backend.put(&key, value);
        }));
    }

    fn delete(&self, key: &str) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let key = key.to_string();
        self.sequence.add(task_only(move || {
            backend.delete(&key);
        }));
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && self.backend.is_healthy()
    }

    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.sequence.cancel_pending_tasks();
        self.backend.shut_down();
    }
}
