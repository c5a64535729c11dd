//! Mutex wrapper turning a single-threaded store into a blocking cache.

use crate::interface::{
    format_name, validate_and_report, BlockingStore, Cache, CacheLookup, LookupCallback,
};
use crate::value::SharedValue;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

/// Serializes all access to a [`BlockingStore`] behind one mutex.
///
/// The store's lock is never held while a callback runs; results are drained
/// out of the critical section first.
pub struct ThreadsafeCache<S: BlockingStore> {
    store: Mutex<S>,
    shutdown: AtomicBool,
}

impl<S: BlockingStore> ThreadsafeCache<S> {
    /// Wrap `store`.
    pub fn new(store: S) -> Self {
        Self {
            store: Mutex::new(store),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Lock and expose the wrapped store. Test and admin inspection only;
    /// holding the guard stalls every cache operation.
    pub fn lock_store(&self) -> MutexGuard<'_, S> {
        self.store.lock()
    }
}

impl<S: BlockingStore> Cache for ThreadsafeCache<S> {
    fn name(&self) -> String {
        format_name("Threadsafe", &[&self.store.lock().name()])
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        if self.shutdown.load(Ordering::Acquire) {
            callback.done(CacheLookup::NotFound);
            return;
        }
        let result = {
            let mut store = self.store.lock();
            store.get(key)
        };
        let lookup = match result {
            Some(value) => CacheLookup::Available(value),
            None => CacheLookup::NotFound,
        };
        validate_and_report(key, callback, lookup);
    }

    fn put(&self, key: &str, value: SharedValue) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.store.lock().put(key, value);
    }

    fn delete(&self, key: &str) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.store.lock().delete(key);
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
