//! Statistics primitives and the per-component counter groups.
//!
//! Cache operations report failures as not-found, so counters are the only
//! place many failure modes are visible. Every group here corresponds to the
//! exported statistics surface: `cache_batcher_*`, `purge_*`, `file_cache_*`,
//! and the per-backend hit/miss/insert/delete counters with latency
//! histograms emitted by the stats wrapper.

#![allow(clippy::cast_precision_loss)] // Statistics calculations accept precision loss

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Create a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` events.
    #[inline]
    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current count.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset to zero. Test and admin-page use only.
    pub fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Settable signed gauge, e.g. the interprocess purge index snapshot.
#[derive(Debug, Default)]
pub struct UpDownCounter(AtomicI64);

impl UpDownCounter {
    /// Create a zeroed gauge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the gauge.
    #[inline]
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Add `delta`, returning the new value.
    #[inline]
    pub fn add(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Number of power-of-two microsecond buckets tracked per histogram.
/// Bucket `i` covers latencies in `[2^i, 2^(i+1))` microseconds; the last
/// bucket absorbs everything slower (~1 minute and up).
const HISTOGRAM_BUCKETS: usize = 26;

/// Lock-free latency histogram with power-of-two microsecond buckets.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
    count: AtomicU64,
    total_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: [(); HISTOGRAM_BUCKETS].map(|()| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one latency sample.
    pub fn record(&self, elapsed: Duration) {
        self.record_raw(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    /// Record a byte-size sample into the same log2 bucket scheme.
    pub fn record_bytes(&self, bytes: usize) {
        self.record_raw(bytes as u64);
    }

    fn record_raw(&self, sample: u64) {
        let bucket = if sample == 0 {
            0
        } else {
            ((63 - u64::leading_zeros(sample)) as usize).min(HISTOGRAM_BUCKETS - 1)
        };
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(sample, Ordering::Relaxed);
    }

    /// Number of recorded samples.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean latency across all samples.
    pub fn average(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_us.load(Ordering::Relaxed) / count)
        }
    }

    /// Point-in-time copy of the bucket counts.
    pub fn snapshot(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Per-backend operation counters and latency histograms, maintained by the
/// stats wrapper around any cache.
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Gets that reported an available, validated value.
    pub hits: Counter,
    /// Gets that reported not-found (including validator rejections).
    pub misses: Counter,
    /// Cache fills. An immediately repeated identical put is not
    /// recounted.
    pub inserts: Counter,
    /// Delete attempts passed to the wrapped cache.
    pub deletes: Counter,
    /// Total bytes of values reported available.
    pub hit_bytes: Counter,
    /// Total bytes of values inserted.
    pub insert_bytes: Counter,
    /// Wall-clock time from get issue to callback completion.
    pub get_latency: LatencyHistogram,
    /// Size distribution of inserted values, in bytes (bucketed log2).
    pub insert_size: LatencyHistogram,
}

impl CacheCounters {
    /// Create a zeroed counter group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hit fraction across all completed gets.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.get();
        let total = hits + self.misses.get();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Counters exported by the cache batcher: `cache_batcher_dropped_gets`,
/// `cache_batcher_coalesced_gets`, `cache_batcher_queued_gets`.
#[derive(Debug, Default)]
pub struct BatcherStats {
    /// Gets rejected immediately because the pending bound was reached.
    pub dropped_gets: Counter,
    /// Gets attached to an already in-flight or queued lookup of their key.
    pub coalesced_gets: Counter,
    /// Gets parked in the queue for the next batch.
    pub queued_gets: Counter,
}

impl BatcherStats {
    /// Create a zeroed counter group.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Counters exported by the purge context: `purge_cancellations`,
/// `purge_contentions`, `purge_file_parse_failures`, `purge_file_stats`,
/// `purge_file_writes`, `purge_file_write_failures`.
#[derive(Debug, Default)]
pub struct PurgeStats {
    /// Pending purges abandoned because the named lock was not acquired.
    pub cancellations: Counter,
    /// Write/verify sequences that found another process's bytes in the file.
    pub contentions: Counter,
    /// Malformed purge-file lines skipped during parsing.
    pub file_parse_failures: Counter,
    /// Purge-file reads (including mtime-only stats in legacy mode).
    pub file_stats: Counter,
    /// Purge-file write attempts.
    pub file_writes: Counter,
    /// Purge requests that failed after exhausting the retry budget.
    pub file_write_failures: Counter,
}

impl PurgeStats {
    /// Create a zeroed counter group.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Counters exported by the file cache: `file_cache_disk_checks`,
/// `file_cache_cleanups`, `file_cache_evictions`,
/// `file_cache_skipped_cleanups`, `file_cache_started_cleanups`,
/// `file_cache_bytes_freed_in_cleanup`.
#[derive(Debug, Default)]
pub struct FileCacheStats {
    /// Full directory scans measuring size and inode count.
    pub disk_checks: Counter,
    /// Cleanups that ran to completion.
    pub cleanups: Counter,
    /// Files evicted by the cleaner.
    pub evictions: Counter,
    /// Cleanups skipped because another process held the clean lock.
    pub skipped_cleanups: Counter,
    /// Cleanups handed to the cleaner worker.
    pub started_cleanups: Counter,
    /// Bytes reclaimed by the cleaner.
    pub bytes_freed_in_cleanup: Counter,
}

impl FileCacheStats {
    /// Create a zeroed counter group.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basics() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.add(3);
        counter.add(1);
        assert_eq!(counter.get(), 4);
        counter.clear();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_up_down_counter() {
        let gauge = UpDownCounter::new();
        gauge.set(10);
        assert_eq!(gauge.add(-3), 7);
        assert_eq!(gauge.get(), 7);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::from_micros(1)); // bucket 0
        histogram.record(Duration::from_micros(3)); // bucket 1
        histogram.record(Duration::from_micros(1024)); // bucket 10
        assert_eq!(histogram.count(), 3);
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot[0], 1);
        assert_eq!(snapshot[1], 1);
        assert_eq!(snapshot[10], 1);
    }

    #[test]
    fn test_histogram_average() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::from_micros(100));
        histogram.record(Duration::from_micros(300));
        assert_eq!(histogram.average(), Duration::from_micros(200));
    }

    #[test]
    fn test_hit_rate() {
        let counters = CacheCounters::new();
        assert_eq!(counters.hit_rate(), 0.0);
        counters.hits.add(3);
        counters.misses.add(1);
        assert!((counters.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
