//! The in-memory purge set: one global invalidation timestamp plus a
//! bounded LRU of per-URL invalidation timestamps.
//!
//! An entry `(url, t)` means every cached response for `url` captured at
//! or before `t` is invalid. The global timestamp does the same for all
//! URLs at once. Timestamps only ever move forward; a merge or a repeated
//! put can never resurrect purged content.

use crate::backends::lru::{LruCacheBase, ValueHelper};

/// Sentinel for "no invalidation has ever happened".
pub const INITIAL_TIMESTAMP_MS: i64 = -1;

/// Purge timestamps further than this beyond the current wall clock are
/// assumed to come from a peer with a broken clock and are rejected.
pub const CLOCK_SKEW_ALLOWANCE_MS: i64 = 10 * 60 * 1000;

/// Keeps the highest timestamp per URL regardless of insertion order.
pub struct PurgeTimestampHelper;

impl ValueHelper<i64> for PurgeTimestampHelper {
    fn size(&self, _value: &i64) -> usize {
        std::mem::size_of::<i64>()
    }

    fn equal(&self, a: &i64, b: &i64) -> bool {
        a == b
    }

    fn should_replace(&self, old_value: &i64, new_value: &i64) -> bool {
        new_value >= old_value
    }
}

pub struct PurgeSet {
    global_invalidation_timestamp_ms: i64,
    urls: LruCacheBase<i64, PurgeTimestampHelper>,
}

impl PurgeSet {
    /// Create an empty set bounded to roughly `max_bytes` of URL entries.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            global_invalidation_timestamp_ms: INITIAL_TIMESTAMP_MS,
            urls: LruCacheBase::with_helper(max_bytes, PurgeTimestampHelper),
        }
    }

    pub fn global_invalidation_timestamp_ms(&self) -> i64 {
        self.global_invalidation_timestamp_ms
    }

    pub fn has_global_invalidation_timestamp(&self) -> bool {
        self.global_invalidation_timestamp_ms != INITIAL_TIMESTAMP_MS
    }

    pub fn num_urls(&self) -> usize {
        self.urls.num_elements()
    }

    /// True iff `timestamp_ms` is plausible as of `now_ms`: at or above
    /// the sentinel and not beyond the clock-skew allowance.
    pub fn is_plausible_timestamp(timestamp_ms: i64, now_ms: i64) -> bool {
        timestamp_ms >= INITIAL_TIMESTAMP_MS
            && timestamp_ms <= now_ms.saturating_add(CLOCK_SKEW_ALLOWANCE_MS)
    }

    /// Record that everything for `url` captured at or before
    /// `timestamp_ms` is invalid. Implausible timestamps are ignored and
    /// reported as false.
    pub fn put(&mut self, url: &str, timestamp_ms: i64, now_ms: i64) -> bool {
        if !Self::is_plausible_timestamp(timestamp_ms, now_ms) {
            return false;
        }
        self.urls.put(url, timestamp_ms);
        true
    }

    /// Raise the global invalidation timestamp. Lowering is a no-op;
    /// implausible values are rejected.
    pub fn update_global_invalidation_timestamp_ms(
        &mut self,
        timestamp_ms: i64,
        now_ms: i64,
    ) -> bool {
        if !Self::is_plausible_timestamp(timestamp_ms, now_ms) {
            return false;
        }
        if timestamp_ms > self.global_invalidation_timestamp_ms {
            self.global_invalidation_timestamp_ms = timestamp_ms;
        }
        true
    }

    /// Is a response for `url` captured at `request_timestamp_ms` still
    /// usable?
    pub fn is_valid(&self, url: &str, request_timestamp_ms: i64) -> bool {
        if request_timestamp_ms <= self.global_invalidation_timestamp_ms {
            return false;
        }
        match self.urls.peek(url) {
            Some(&purge_ms) => request_timestamp_ms > purge_ms,
            None => true,
        }
    }

    /// Fold `other` into `self`: global timestamps take the max, URL
    /// entries merge with per-URL maxima, and `other`'s recency order is
    /// replayed so its most recent purges survive eviction longest.
    pub fn merge(&mut self, other: &PurgeSet) {
        if other.global_invalidation_timestamp_ms > self.global_invalidation_timestamp_ms {
            self.global_invalidation_timestamp_ms = other.global_invalidation_timestamp_ms;
        }
        other.urls.for_each_lru_to_mru(|url, &timestamp_ms| {
            self.urls.put(url, timestamp_ms);
        });
    }

    pub fn equals(&self, other: &PurgeSet) -> bool {
        if self.global_invalidation_timestamp_ms != other.global_invalidation_timestamp_ms
            || self.urls.num_elements() != other.urls.num_elements()
        {
            return false;
        }
        let mut entries = Vec::with_capacity(self.urls.num_elements());
        self.urls.for_each_lru_to_mru(|url, &ts| entries.push((url.to_string(), ts)));
        let mut matches = true;
        let mut index = 0;
        other.urls.for_each_lru_to_mru(|url, &ts| {
            if entries.get(index).map(|(u, t)| (u.as_str(), *t)) != Some((url, ts)) {
                matches = false;
            }
            index += 1;
        });
        matches
    }

    /// Serialize to purge-file form: the global timestamp on line one,
    /// then one `<timestamp> <url>` line per entry, least recent first.
    pub fn serialize(&self) -> String {
        let mut out = format!("{}\n", self.global_invalidation_timestamp_ms);
        self.urls.for_each_lru_to_mru(|url, &timestamp_ms| {
            out.push_str(&format!("{timestamp_ms} {url}\n"));
        });
        out
    }

    /// Parse purge-file contents as of `now_ms`. Malformed or implausibly
    /// timestamped lines are skipped; the skip count is returned so the
    /// caller can feed its parse-failure statistic. A blank first line
    /// leaves the global timestamp at the sentinel.
    pub fn parse(contents: &str, now_ms: i64, max_bytes: usize) -> (Self, u64) {
        let mut set = Self::new(max_bytes);
        let mut parse_failures = 0;
        let mut first_line = true;
        for line in contents.lines() {
            let line_is_first = first_line;
            first_line = false;
            if line.is_empty() {
                continue;
            }
            if line_is_first {
                match line.parse::<i64>() {
                    Ok(timestamp_ms)
                        if set.update_global_invalidation_timestamp_ms(timestamp_ms, now_ms) => {}
                    _ => parse_failures += 1,
                }
                continue;
            }
            let parsed = line
                .split_once(' ')
                .and_then(|(ts, url)| ts.parse::<i64>().ok().map(|ts| (ts, url)));
            match parsed {
                Some((timestamp_ms, url)) if set.put(url, timestamp_ms, now_ms) => {}
                _ => parse_failures += 1,
            }
        }
        (set, parse_failures)
    }
}
