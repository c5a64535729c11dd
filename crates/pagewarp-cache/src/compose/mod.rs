//! Cache adapters that layer behavior over other caches: thread safety,
//! two-level write-through, size-based fallback routing, transparent
//! compression, and operation statistics.

mod compressed;
mod fallback;
mod stats;
mod threadsafe;
mod write_through;

pub use compressed::{CompressedCache, CompressedCacheStats};
pub use fallback::FallbackCache;
pub use stats::StatsCache;
pub use threadsafe::ThreadsafeCache;
pub use write_through::WriteThroughCache;

use crate::codec::encode_key_in_value;
use crate::interface::Cache;
use crate::value::SharedValue;

/// Put into `cache`, first folding the key into the value when the
/// backend stores entries under hashed keys and needs the original key
/// embedded for collision detection on get.
pub(crate) fn put_with_encoding(cache: &dyn Cache, key: &str, value: SharedValue) {
    if cache.must_encode_key_in_value() {
        cache.put(key, encode_key_in_value(key, &value));
    } else {
        cache.put(key, value);
    }
}
