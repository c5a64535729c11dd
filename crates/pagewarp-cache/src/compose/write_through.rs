//! Two-level write-through composition: a small fast L1 in front of a
//! larger, farther L2.
//!
//! Puts land in L2 always and in L1 when the entry fits the L1 size cap.
//! Gets probe L1 first; on a miss (or a validator rejection) they fall
//! through to L2 and back-fill L1 with what they find.

use crate::interface::{format_name, Cache, CacheLookup, LookupCallback};
use crate::value::SharedValue;
use std::sync::Arc;

use super::put_with_encoding;

/// No entry-size cap for L1.
pub const UNLIMITED: usize = usize::MAX;

/// L1/L2 write-through composer.
pub struct WriteThroughCache {
    level1: Arc<dyn Cache>,
    level2: Arc<dyn Cache>,
    /// Entries whose key+value exceeds this many bytes skip L1.
    cache1_size_limit: usize,
}

impl WriteThroughCache {
    /// Compose `level1` (smaller, faster) in front of `level2` with no L1
    /// entry-size cap.
    pub fn new(level1: Arc<dyn Cache>, level2: Arc<dyn Cache>) -> Self {
        Self::with_size_limit(level1, level2, UNLIMITED)
    }

    /// Compose with an L1 per-entry byte cap covering key plus value.
    pub fn with_size_limit(
        level1: Arc<dyn Cache>,
        level2: Arc<dyn Cache>,
        cache1_size_limit: usize,
    ) -> Self {
        Self {
            level1,
            level2,
            cache1_size_limit,
        }
    }

    fn fits_level1(&self, key: &str, value: &SharedValue) -> bool {
        key.len().saturating_add(value.len()) <= self.cache1_size_limit
    }
}

/// Falls through to L2 when L1 misses or its candidate is rejected.
struct Level1Callback {
    key: String,
    level1: Arc<dyn Cache>,
    level2: Arc<dyn Cache>,
    cache1_size_limit: usize,
    inner: Box<dyn LookupCallback>,
}

impl LookupCallback for Level1Callback {
    fn validate_candidate(&mut self, key: &str, value: &SharedValue) -> bool {
        self.inner.validate_candidate(key, value)
    }

    fn done(self: Box<Self>, lookup: CacheLookup) {
        match lookup {
            CacheLookup::Available(value) => self.inner.done(CacheLookup::Available(value)),
            CacheLookup::NotFound => {
                let this = *self;
                let key = this.key;
                this.level2.get(
                    &key.clone(),
                    Box::new(Level2Callback {
                        key,
                        level1: this.level1,
                        cache1_size_limit: this.cache1_size_limit,
                        inner: this.inner,
                    }),
                );
            }
        }
    }
}

/// Back-fills L1 with whatever L2 produced, within the size cap.
struct Level2Callback {
    key: String,
    level1: Arc<dyn Cache>,
    cache1_size_limit: usize,
    inner: Box<dyn LookupCallback>,
}

impl LookupCallback for Level2Callback {
    fn validate_candidate(&mut self, key: &str, value: &SharedValue) -> bool {
        self.inner.validate_candidate(key, value)
    }

    fn done(self: Box<Self>, lookup: CacheLookup) {
        if let CacheLookup::Available(value) = &lookup {
            if self.key.len().saturating_add(value.len()) <= self.cache1_size_limit {
                put_with_encoding(self.level1.as_ref(), &self.key, value.clone());
            }
        }
        self.inner.done(lookup);
    }
}

impl Cache for WriteThroughCache {
    fn name(&self) -> String {
        format_name("WriteThrough", &[&self.level1.name(), &self.level2.name()])
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        self.level1.get(
            key,
            Box::new(Level1Callback {
                key: key.to_string(),
                level1: Arc::clone(&self.level1),
                level2: Arc::clone(&self.level2),
                cache1_size_limit: self.cache1_size_limit,
                inner: callback,
            }),
        );
    }

    fn put(&self, key: &str, value: SharedValue) {
        put_with_encoding(self.level2.as_ref(), key, value.clone());
        if self.fits_level1(key, &value) {
            put_with_encoding(self.level1.as_ref(), key, value);
        }
    }

    fn delete(&self, key: &str) {
        self.level1.delete(key);
        self.level2.delete(key);
    }

    fn is_blocking(&self) -> bool {
        self.level1.is_blocking() && self.level2.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.level1.is_healthy() && self.level2.is_healthy()
    }

    fn shut_down(&self) {
        self.level1.shut_down();
        self.level2.shut_down();
    }
}
