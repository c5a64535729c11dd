//! Size-routed composition over a small cache with a per-entry capacity
//! limit (typically shared-memory) and a large cache without one
//! (typically on disk).
//!
//! Small values are stored in the small cache directly. Values over the
//! threshold go to the large cache, and the small cache holds a redirect
//! marker in their place so that a get never has to probe both backends
//! blindly. Every value written to the small cache carries a trailing
//! flag byte distinguishing the two forms.

use crate::interface::{format_name, Cache, CacheLookup, LookupCallback, MultiGetRequest};
use crate::value::SharedValue;
use std::sync::Arc;

use super::put_with_encoding;

/// Trailing byte on small-cache values holding the payload inline.
const FLAG_DIRECT: u8 = b'0';
/// Trailing byte on small-cache values redirecting to the large cache.
/// The bytes before the flag are the entry's own key, so a stale or
/// colliding marker can be detected before probing the large cache.
const FLAG_IN_LARGE: u8 = b'1';

enum SmallEntry {
    Direct(SharedValue),
    Marker(SharedValue),
    Malformed,
}

fn classify(value: &SharedValue) -> SmallEntry {
    let bytes = value.as_bytes();
    let Some((&flag, _)) = bytes.split_last() else {
        return SmallEntry::Malformed;
    };
    let body = value.clone().into_bytes().slice(..bytes.len() - 1);
    match flag {
        FLAG_DIRECT => SmallEntry::Direct(SharedValue::from(body)),
        FLAG_IN_LARGE => SmallEntry::Marker(SharedValue::from(body)),
        _ => SmallEntry::Malformed,
    }
}

fn flagged(value: &SharedValue, flag: u8) -> SharedValue {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(flag);
    SharedValue::from(out)
}

/// Routes entries between a capacity-limited small cache and an
/// unlimited large cache based on a byte threshold.
pub struct FallbackCache {
    small: Arc<dyn Cache>,
    large: Arc<dyn Cache>,
    threshold_bytes: usize,
    account_for_key_size: bool,
}

impl FallbackCache {
    pub fn new(
        small: Arc<dyn Cache>,
        large: Arc<dyn Cache>,
        threshold_bytes: usize,
        account_for_key_size: bool,
    ) -> Self {
        Self {
            small,
            large,
            threshold_bytes,
            account_for_key_size,
        }
    }

    fn fits_small(&self, key: &str, value: &SharedValue) -> bool {
        let keyed = if self.account_for_key_size {
            key.len()
        } else {
            0
        };
        value.len().saturating_add(keyed) <= self.threshold_bytes
    }

    fn wrap(&self, key: &str, callback: Box<dyn LookupCallback>) -> Box<dyn LookupCallback> {
        Box::new(SmallCallback {
            key: key.to_string(),
            large: Arc::clone(&self.large),
            inner: callback,
        })
    }
}

struct SmallCallback {
    key: String,
    large: Arc<dyn Cache>,
    inner: Box<dyn LookupCallback>,
}

impl LookupCallback for SmallCallback {
    fn validate_candidate(&mut self, key: &str, value: &SharedValue) -> bool {
        match classify(value) {
            SmallEntry::Direct(body) => self.inner.validate_candidate(key, &body),
            // The caller's validator runs against the real payload when
            // the large cache answers.
            SmallEntry::Marker(_) => true,
            SmallEntry::Malformed => false,
        }
    }

    fn done(self: Box<Self>, lookup: CacheLookup) {
        match lookup {
            CacheLookup::Available(value) => match classify(&value) {
                SmallEntry::Direct(body) => self.inner.done(CacheLookup::Available(body)),
                SmallEntry::Marker(marker_key)
                    if marker_key.as_bytes() == self.key.as_bytes() =>
                {
                    self.large.get(&self.key, self.inner);
                }
                // A marker naming a different key is a collision or
                // corruption, not a hit.
                SmallEntry::Marker(_) | SmallEntry::Malformed => {
                    self.inner.done(CacheLookup::NotFound);
                }
            },
            CacheLookup::NotFound => self.inner.done(CacheLookup::NotFound),
        }
    }
}

impl Cache for FallbackCache {
    fn name(&self) -> String {
        format_name("Fallback", &[&self.small.name(), &self.large.name()])
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        let wrapped = self.wrap(key, callback);
        self.small.get(key, wrapped);
    }

    fn multi_get(&self, requests: Vec<MultiGetRequest>) {
        let wrapped = requests
            .into_iter()
            .map(|request| {
                let callback = self.wrap(&request.key, request.callback);
                MultiGetRequest {
                    key: request.key,
                    callback,
                }
            })
            .collect();
        self.small.multi_get(wrapped);
    }

    fn put(&self, key: &str, value: SharedValue) {
        if self.fits_small(key, &value) {
            put_with_encoding(self.small.as_ref(), key, flagged(&value, FLAG_DIRECT));
        } else {
            put_with_encoding(self.large.as_ref(), key, value);
            let marker = flagged(&SharedValue::from(key), FLAG_IN_LARGE);
            put_with_encoding(self.small.as_ref(), key, marker);
        }
    }

    fn delete(&self, key: &str) {
        self.small.delete(key);
        self.large.delete(key);
    }

    fn is_blocking(&self) -> bool {
        self.small.is_blocking() && self.large.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.small.is_healthy() && self.large.is_healthy()
    }

    fn shut_down(&self) {
        self.small.shut_down();
        self.large.shut_down();
    }
}
