//! Multi-tier, multi-process caching for the Pagewarp web optimization engine
//!
//! This crate implements the cache stack that sits between the rewrite engine
//! and its storage: an in-process LRU, a shared-memory table mapped by every
//! worker process, a bounded file tree with a cooperative cleaner, and remote
//! key-value servers behind a pluggable protocol contract. All of them are
//! presented through one asynchronous `Get`/`Put`/`Delete` interface with
//! per-lookup validation callbacks.
//!
//! # Features
//!
//! - **Composable adapters**: write-through pairing, size-based fallback,
//!   gzip compression, per-tier statistics, async dispatch, and lookup
//!   batching can be layered in any order over any backend
//! - **Worker sequencing**: a fixed thread pool runs FIFO sequences with
//!   cancellation, load shedding, and two-phase shutdown
//! - **Cross-process purging**: per-URL and global invalidations are made
//!   durable in a lock-protected purge file and propagated to peer
//!   processes through a shared memory-mapped index
//! - **Filesystem metadata validation**: on-disk inputs are revalidated by
//!   mtime and content hash without re-reading unchanged files
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               rewrite engine                  │
//! └───────────────────────────────────────────────┘
//!          │ Get(key, callback) / Put / Delete
//! ┌───────────────────────────────────────────────┐
//! │   WriteThrough(Stats(Threadsafe(Lru)), L2)    │
//! │   L2: Batcher(Async(Remote | FileCache))      │
//! │   metadata: [Compressed] Fallback(Shm, L2)    │
//! └───────────────────────────────────────────────┘
//!          │ sequences                │ purge file + index
//! ┌──────────────────┐   ┌────────────────────────┐
//! │   worker pool    │   │      purge context     │
//! └──────────────────┘   └────────────────────────┘
//! ```
//!
//! A lookup callback is invoked exactly once per accepted operation,
//! always outside the caches' internal locks. Failures of any kind
//! surface to callers as a not-found result plus a statistics counter,
//! never as an error.
//!
//! # Usage
//!
//! ```no_run
//! use pagewarp_cache::config::{CacheConfig, FileCacheSettings};
//! use pagewarp_cache::stack::CacheStackBuilder;
//! use pagewarp_cache::value::SharedValue;
//!
//! # fn main() -> Result<(), pagewarp_cache::error::CacheError> {
//! let config = CacheConfig {
//!     file_cache: FileCacheSettings {
//!         path: "/var/cache/pagewarp".into(),
//!         ..FileCacheSettings::default()
//!     },
//!     ..CacheConfig::default()
//! };
//! let stack = CacheStackBuilder::new(config).build()?;
//! stack.http_cache().put("http://example.com/a.css", SharedValue::from("body{}"));
//! # Ok(())
//! # }
//! ```

pub mod async_cache;
pub mod backends;
pub mod batcher;
pub mod clock;
pub mod codec;
pub mod compose;
pub mod config;
pub mod error;
pub mod fs_metadata;
pub mod interface;
pub mod purge;
pub mod sequencer;
pub mod stack;
pub mod stats;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use async_cache::AsyncCache;
pub use batcher::CacheBatcher;
pub use compose::{
    CompressedCache, FallbackCache, StatsCache, ThreadsafeCache, WriteThroughCache,
};
pub use error::{CacheError, CacheResult};
pub use interface::{
    blocking_get, Cache, CacheLookup, LookupCallback, MultiGetRequest,
};
pub use sequencer::{Sequence, SequenceTask, WorkerPool};
pub use stack::{CacheStack, CacheStackBuilder};
pub use value::SharedValue;
