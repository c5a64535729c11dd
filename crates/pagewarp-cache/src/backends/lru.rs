//! Bounded in-process LRU storage.
//!
//! [`LruCacheBase`] is a general-purpose least-recently-used map from string
//! keys to arbitrary values, budgeted in bytes. It is deliberately not
//! thread-safe; wrap it in [`crate::compose::ThreadsafeCache`] to expose it
//! through the cache interface, or embed it directly where an external mutex
//! already exists (the purge set does this).
//!
//! Behavior is parameterized by a [`ValueHelper`]: how big a value is, when
//! two values are equal (a put of a byte-identical value is a no-op that does
//! not churn the chain), and whether a new value may replace an old one (the
//! purge set uses this for monotonic timestamps).

use std::collections::HashMap;

/// Policy hooks for [`LruCacheBase`].
pub trait ValueHelper<V> {
    /// Bytes consumed by a value (keys are accounted separately).
    fn size(&self, value: &V) -> usize;

    /// Whether two values are interchangeable; equal re-puts are no-ops.
    fn equal(&self, a: &V, b: &V) -> bool;

    /// Whether `new_value` should supersede `old_value` on a put.
    fn should_replace(&self, old_value: &V, new_value: &V) -> bool {
        let _ = (old_value, new_value);
        true
    }
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<V> {
    key: String,
    value: V,
    prev: usize,
    next: usize,
}

/// Mutation counters for an LRU instance. Read under the owner's lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LruStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Puts that created or replaced an entry.
    pub inserts: u64,
    /// Deletes that removed an entry.
    pub deletes: u64,
    /// Entries dropped to stay under the byte budget.
    pub evictions: u64,
    /// Puts of a byte-identical value, absorbed without churn.
    pub identical_reinserts: u64,
}

/// Byte-budgeted LRU map. Not thread-safe.
#[derive(Debug)]
pub struct LruCacheBase<V, H: ValueHelper<V>> {
    helper: H,
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    max_bytes: usize,
    current_bytes: usize,
    stats: LruStats,
}

impl<V, H: ValueHelper<V>> LruCacheBase<V, H> {
    /// Create an LRU with the given byte budget and policy.
    pub fn with_helper(max_bytes: usize, helper: H) -> Self {
        Self {
            helper,
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            max_bytes,
            current_bytes: 0,
            stats: LruStats::default(),
        }
    }

    /// Reset the byte budget. Shrinking does not evict immediately; the next
    /// put brings usage back under the limit.
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Configured byte budget.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Bytes currently accounted to live entries (keys plus values).
    pub fn size_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Number of live entries.
    pub fn num_elements(&self) -> usize {
        self.map.len()
    }

    /// Mutation counters.
    pub fn stats(&self) -> LruStats {
        self.stats
    }

    fn entry_size(&self, key: &str, value: &V) -> usize {
        key.len() + self.helper.size(value)
    }

    fn unlink(&mut self, index: usize) {
        let Some((prev, next)) = self.nodes[index].as_ref().map(|n| (n.prev, n.next)) else {
            return;
        };
        if prev == NIL {
            self.head = next;
        } else if let Some(p) = self.nodes[prev].as_mut() {
            p.next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else if let Some(n) = self.nodes[next].as_mut() {
            n.prev = prev;
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[index].as_mut() {
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            if let Some(h) = self.nodes[old_head].as_mut() {
                h.prev = index;
            }
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
    }

    fn allocate(&mut self, node: Node<V>) -> usize {
        if let Some(index) = self.free.pop() {
            self.nodes[index] = Some(node);
            index
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn remove_index(&mut self, index: usize) {
        self.unlink(index);
        if let Some(node) = self.nodes[index].take() {
            self.free.push(index);
            self.map.remove(&node.key);
            self.current_bytes -= self.entry_size(&node.key, &node.value);
        }
    }

    /// Look up `key`, freshening it to most-recently-used on a hit.
    pub fn get_freshen(&mut self, key: &str) -> Option<&V> {
        if let Some(&index) = self.map.get(key) {
            self.stats.hits += 1;
            self.unlink(index);
            self.push_front(index);
            self.nodes[index].as_ref().map(|n| &n.value)
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Look up `key` without disturbing recency or counting a hit/miss.
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.map
            .get(key)
            .and_then(|&index| self.nodes[index].as_ref())
            .map(|n| &n.value)
    }

    /// Insert or replace `key`. Values equal to the incumbent are absorbed
    /// without churn; values the helper declines to replace are dropped.
    /// Entries larger than the whole budget are not stored.
    pub fn put(&mut self, key: &str, value: V) {
        if let Some(&index) = self.map.get(key) {
            let (replace, identical) =
                self.nodes[index].as_ref().map_or((true, false), |node| {
                    if self.helper.equal(&node.value, &value) {
                        (false, true)
                    } else {
                        (self.helper.should_replace(&node.value, &value), false)
                    }
                });
            if identical {
                self.stats.identical_reinserts += 1;
                self.unlink(index);
                self.push_front(index);
                return;
            }
            if !replace {
                return;
            }
            self.remove_index(index);
        }

        let entry_size = self.entry_size(key, &value);
        if entry_size > self.max_bytes {
            return;
        }
        while self.current_bytes + entry_size > self.max_bytes {
            let tail = self.tail;
            if tail == NIL {
                break;
            }
            self.remove_index(tail);
            self.stats.evictions += 1;
        }

        let index = self.allocate(Node {
            key: key.to_string(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.push_front(index);
        self.map.insert(key.to_string(), index);
        self.current_bytes += entry_size;
        self.stats.inserts += 1;
    }

    /// Remove `key` if present.
    pub fn delete(&mut self, key: &str) {
        if let Some(&index) = self.map.get(key) {
            self.remove_index(index);
            self.stats.deletes += 1;
        }
    }

    /// Visit entries from least- to most-recently used.
    pub fn for_each_lru_to_mru(&self, mut visit: impl FnMut(&str, &V)) {
        let mut index = self.tail;
        while index != NIL {
            if let Some(node) = self.nodes[index].as_ref() {
                visit(&node.key, &node.value);
                index = node.prev;
            } else {
                break;
            }
        }
    }

    /// Verify internal invariants; panics on corruption. Test use only.
    pub fn sanity_check(&self) {
        let mut seen = 0usize;
        let mut bytes = 0usize;
        let mut index = self.head;
        let mut prev = NIL;
        while index != NIL {
            // A chain link into a free slot shows up as a length mismatch
            // in the final asserts.
            let Some(node) = self.nodes[index].as_ref() else {
                break;
            };
            assert_eq!(node.prev, prev, "broken back-link at {}", node.key);
            assert_eq!(
                self.map.get(&node.key),
                Some(&index),
                "map disagrees with chain at {}",
                node.key
            );
            bytes += self.entry_size(&node.key, &node.value);
            seen += 1;
            prev = index;
            index = node.next;
        }
        assert_eq!(prev, self.tail, "tail does not terminate the chain");
        assert_eq!(seen, self.map.len(), "chain length disagrees with map");
        assert_eq!(bytes, self.current_bytes, "byte accounting drifted");
    }
}

/// Value policy for plain byte-string payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedValueHelper;

impl ValueHelper<crate::value::SharedValue> for SharedValueHelper {
    fn size(&self, value: &crate::value::SharedValue) -> usize {
        value.len()
    }

    fn equal(&self, a: &crate::value::SharedValue, b: &crate::value::SharedValue) -> bool {
        a == b
    }
}

/// The in-process LRU backend: string keys to shared byte values, bounded in
/// bytes. Not thread-safe; serve it through
/// [`crate::compose::ThreadsafeCache`].
pub type LruCache = LruCacheBase<crate::value::SharedValue, SharedValueHelper>;

impl LruCache {
    /// Create an LRU backend with the given byte budget.
    pub fn new(max_bytes: usize) -> Self {
        Self::with_helper(max_bytes, SharedValueHelper)
    }
}

impl crate::interface::BlockingStore for LruCache {
    fn name(&self) -> String {
        "Lru".to_string()
    }

    fn get(&mut self, key: &str) -> Option<crate::value::SharedValue> {
        self.get_freshen(key).cloned()
    }

    fn put(&mut self, key: &str, value: crate::value::SharedValue) {
        LruCacheBase::put(self, key, value);
    }

    fn delete(&mut self, key: &str) {
        LruCacheBase::delete(self, key);
    }
}
