//! Builds the full cache stack a server uses from one [`CacheConfig`].
//!
//! The shape, outermost first:
//!
//! ```text
//! http:     WriteThrough(Stats(Threadsafe(Lru)), L2)
//! L2:       Stats(Batcher(Async(Remote)))  over  Stats(Async(Threadsafe(FileCache)))
//!           or just the file tier when no remote servers are configured
//! metadata: [Compressed] Fallback(Shm, L2)  or  [Compressed] L2
//! ```
//!
//! plus one worker pool that drives the async wrappers and the purge
//! writer, and one [`PurgeContext`] watching the flush file.

use crate::async_cache::AsyncCache;
use crate::backends::file::{FileCache, FileCachePolicy};
use crate::backends::lru::LruCache;
use crate::backends::remote::{KeyValueClient, RemoteCache, RemoteCacheOptions};
use crate::backends::shm::{ShmCache, ShmCachePolicy};
use crate::batcher::CacheBatcher;
use crate::compose::{
    CompressedCache, FallbackCache, StatsCache, ThreadsafeCache, WriteThroughCache,
};
use crate::config::{CacheConfig, RemoteBackendChoice};
use crate::error::{CacheError, CacheResult};
use crate::interface::Cache;
use crate::purge::{PurgeContext, PurgeContextOptions};
use crate::sequencer::WorkerPool;
use crate::stats::CacheCounters;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Segment file for the default shared-memory cache, kept under the
/// file cache root so every process agrees on it.
const DEFAULT_SHM_SEGMENT: &str = "!shm!metadata";

pub struct CacheStackBuilder {
    config: CacheConfig,
    remote_clients: Vec<Box<dyn KeyValueClient>>,
}

impl CacheStackBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            remote_clients: Vec::new(),
        }
    }

    /// Supply the protocol clients for the configured remote servers.
    /// The framers live outside this crate; the builder only wires them
    /// into the stack.
    pub fn remote_clients(mut self, clients: Vec<Box<dyn KeyValueClient>>) -> Self {
        self.remote_clients = clients;
        self
    }

    pub fn build(self) -> CacheResult<CacheStack> {
        let config = self.config;
        config.validate()?;

        let pool = WorkerPool::new(1 + config.remote_io_threads() as usize)?;

        let file_store = FileCache::new(
            &config.file_cache.path,
            FileCachePolicy {
                target_size_bytes: config.file_cache.clean_size_kb * 1024,
                target_inode_count: config.file_cache.clean_inode_limit,
                clean_interval_ms: config.file_cache.clean_interval_ms,
            },
        )?;
        let file_cache_stats = file_store.stats();
        let file_counters = Arc::new(CacheCounters::new());
        let file_tier: Arc<dyn Cache> = Arc::new(StatsCache::with_counters(
            Arc::new(AsyncCache::new(
                Arc::new(ThreadsafeCache::new(file_store)),
                &pool,
            )),
            Arc::clone(&file_counters),
        ));

        let remote_counters = Arc::new(CacheCounters::new());
        let l2: Arc<dyn Cache> = match config.remote_backend() {
            RemoteBackendChoice::None => Arc::clone(&file_tier),
            RemoteBackendChoice::Memcached { timeout, .. }
            | RemoteBackendChoice::Redis { timeout, .. } => {
                if self.remote_clients.is_empty() {
                    return Err(CacheError::InvalidConfiguration(
                        "remote servers configured but no protocol clients supplied".to_string(),
                    ));
                }
                let remote = Arc::new(RemoteCache::new(
                    self.remote_clients,
                    RemoteCacheOptions {
                        operation_timeout: timeout,
                        ..RemoteCacheOptions::default()
                    },
                )?);
                let remote: Arc<dyn Cache> = if config.remote_io_threads() >= 1 {
                    Arc::new(AsyncCache::new(remote, &pool))
                } else {
                    remote
                };
                let remote: Arc<dyn Cache> = Arc::new(StatsCache::with_counters(
                    Arc::new(CacheBatcher::new(remote)),
                    Arc::clone(&remote_counters),
                ));
                Arc::new(WriteThroughCache::new(remote, Arc::clone(&file_tier)))
            }
        };

        let metadata_base: Arc<dyn Cache> = if config.default_shared_memory_cache_kb > 0 {
            let policy = ShmCachePolicy {
                size_bytes: (config.default_shared_memory_cache_kb * 1024) as usize,
                ..ShmCachePolicy::default()
            };
            let segment_path = config.file_cache.path.join(DEFAULT_SHM_SEGMENT);
            let shm = Arc::new(ShmCache::new(&segment_path, "default", &policy)?);
            let threshold = shm.max_value_size();
            Arc::new(FallbackCache::new(shm, Arc::clone(&l2), threshold, true))
        } else {
            Arc::clone(&l2)
        };
        let metadata_cache: Arc<dyn Cache> = if config.compress_metadata_cache {
            Arc::new(CompressedCache::new(metadata_base))
        } else {
            metadata_base
        };

        let l1_counters = Arc::new(CacheCounters::new());
        let http_cache: Arc<dyn Cache> = if config.lru_cache_kb_per_process > 0 {
            let l1: Arc<dyn Cache> = Arc::new(StatsCache::with_counters(
                Arc::new(ThreadsafeCache::new(LruCache::new(
                    (config.lru_cache_kb_per_process * 1024) as usize,
                ))),
                Arc::clone(&l1_counters),
            ));
            Arc::new(WriteThroughCache::with_size_limit(
                l1,
                Arc::clone(&l2),
                config.lru_cache_byte_limit as usize,
            ))
        } else {
            Arc::clone(&l2)
        };

        let flush_path = {
            let configured = PathBuf::from(&config.cache_flush_filename);
            if configured.is_relative() {
                config.file_cache.path.join(configured)
            } else {
                configured
            }
        };
        let purge = PurgeContext::new(
            flush_path,
            PurgeContextOptions {
                enable_purge: config.enable_cache_purge,
                check_cache_interval_ms: (config.cache_flush_poll_interval_sec * 1000) as i64,
                ..PurgeContextOptions::default()
            },
            pool.new_sequence(),
        )?;

        info!(
            http = %http_cache.name(),
            metadata = %metadata_cache.name(),
            "cache stack assembled"
        );
        Ok(CacheStack {
            pool,
            http_cache,
            metadata_cache,
            purge,
            l1_counters,
            remote_counters,
            file_counters,
            file_cache_stats,
        })
    }
}

/// The assembled caches plus the machinery that drives them.
pub struct CacheStack {
    pool: WorkerPool,
    http_cache: Arc<dyn Cache>,
    metadata_cache: Arc<dyn Cache>,
    purge: Arc<PurgeContext>,
    l1_counters: Arc<CacheCounters>,
    remote_counters: Arc<CacheCounters>,
    file_counters: Arc<CacheCounters>,
    file_cache_stats: Arc<crate::stats::FileCacheStats>,
}

impl CacheStack {
    /// Cache for optimized HTTP payloads.
    pub fn http_cache(&self) -> &Arc<dyn Cache> {
        &self.http_cache
    }

    /// Cache for rewrite metadata and filesystem metadata entries.
    pub fn metadata_cache(&self) -> &Arc<dyn Cache> {
        &self.metadata_cache
    }

    pub fn purge(&self) -> &Arc<PurgeContext> {
        &self.purge
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn l1_counters(&self) -> &CacheCounters {
        &self.l1_counters
    }

    pub fn remote_counters(&self) -> &CacheCounters {
        &self.remote_counters
    }

    pub fn file_counters(&self) -> &CacheCounters {
        &self.file_counters
    }

    pub fn file_cache_stats(&self) -> &crate::stats::FileCacheStats {
        &self.file_cache_stats
    }

    /// Stop accepting work and drain the pool. Safe to call more than
    /// once; the pool's own shutdown is idempotent.
    pub fn shut_down(&self) {
        self.http_cache.shut_down();
        self.metadata_cache.shut_down();
        self.pool.shut_down();
    }
}
