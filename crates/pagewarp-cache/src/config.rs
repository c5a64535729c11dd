//! Cache stack configuration.
//!
//! One `CacheConfig` describes everything `stack::CacheStack` needs to
//! build: the per-process L1, the optional shared-memory default cache,
//! the file cache and its cleaner, an optional remote tier, and the
//! purge mode. Virtual hosts sharing a file cache path merge their
//! cleaner settings with defined winners, so any two hosts agree on
//! what the shared directory looks like.

use crate::error::{CacheError, CacheResult};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// File cache sizing and cleaner cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCacheSettings {
    pub path: PathBuf,
    pub clean_size_kb: u64,
    /// 0 means unlimited.
    pub clean_inode_limit: u64,
    /// Negative disables the cleaner.
    pub clean_interval_ms: i64,
}

impl Default for FileCacheSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            clean_size_kb: 100 * 1024,
            clean_inode_limit: 0,
            clean_interval_ms: 60 * 60 * 1000,
        }
    }
}

impl FileCacheSettings {
    /// Reconcile with another host's settings for the same path. The
    /// larger size wins, the smaller interval wins, and the smaller
    /// nonzero inode limit wins. Disagreements are logged so operators
    /// can unify their host configs, but the resolution is defined.
    pub fn merge(&mut self, other: &Self) {
        if other.clean_size_kb != self.clean_size_kb {
            warn!(
                path = %self.path.display(),
                ours = self.clean_size_kb,
                theirs = other.clean_size_kb,
                "conflicting file cache sizes, larger wins"
            );
            self.clean_size_kb = self.clean_size_kb.max(other.clean_size_kb);
        }
        if other.clean_interval_ms != self.clean_interval_ms {
            warn!(
                path = %self.path.display(),
                ours = self.clean_interval_ms,
                theirs = other.clean_interval_ms,
                "conflicting file cache clean intervals, smaller wins"
            );
            self.clean_interval_ms = self.clean_interval_ms.min(other.clean_interval_ms);
        }
        if other.clean_inode_limit != self.clean_inode_limit {
            warn!(
                path = %self.path.display(),
                ours = self.clean_inode_limit,
                theirs = other.clean_inode_limit,
                "conflicting file cache inode limits, smaller wins"
            );
            // 0 is unlimited, so "smaller wins" means smaller nonzero.
            self.clean_inode_limit = match (self.clean_inode_limit, other.clean_inode_limit) {
                (0, limit) | (limit, 0) => limit,
                (ours, theirs) => ours.min(theirs),
            };
        }
    }
}

/// A named shared-memory segment beyond the default one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmSegmentSettings {
    pub name: String,
    pub size_kb: u64,
}

/// Which remote backend the configuration selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteBackendChoice {
    None,
    Memcached {
        servers: Vec<String>,
        timeout: Duration,
    },
    Redis {
        server: String,
        timeout: Duration,
        reconnection_delay: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L1 LRU capacity per process. 0 disables the L1 entirely.
    pub lru_cache_kb_per_process: u64,
    /// Per-entry size cap for the L1 inside a write-through pair.
    pub lru_cache_byte_limit: u64,
    /// Default shm cache size. 0 disables the shm tier.
    pub default_shared_memory_cache_kb: u64,
    /// Extra named shm segments (per-host metadata caches).
    pub shm_segments: Vec<ShmSegmentSettings>,
    pub file_cache: FileCacheSettings,
    pub memcached_servers: Vec<String>,
    /// When set alongside memcached servers, Redis wins.
    pub redis_server: Option<String>,
    /// 0 keeps remote calls on the request thread; >= 1 moves them to
    /// the worker pool (clamped to a single slot).
    pub memcached_threads: u64,
    pub memcached_timeout_us: u64,
    pub redis_timeout_us: u64,
    pub redis_reconnection_delay_ms: u64,
    pub compress_metadata_cache: bool,
    /// false selects legacy mtime-only flushing.
    pub enable_cache_purge: bool,
    pub cache_flush_filename: String,
    pub cache_flush_poll_interval_sec: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lru_cache_kb_per_process: 1024,
            lru_cache_byte_limit: 16 * 1024,
            default_shared_memory_cache_kb: 0,
            shm_segments: Vec::new(),
            file_cache: FileCacheSettings::default(),
            memcached_servers: Vec::new(),
            redis_server: None,
            memcached_threads: 1,
            memcached_timeout_us: 50_000,
            redis_timeout_us: 50_000,
            redis_reconnection_delay_ms: 1_000,
            compress_metadata_cache: false,
            enable_cache_purge: false,
            cache_flush_filename: "cache.flush".to_string(),
            cache_flush_poll_interval_sec: 5,
        }
    }
}

impl CacheConfig {
    /// Check construction-time invariants. Called by the stack builder
    /// before any backend is created.
    pub fn validate(&self) -> CacheResult<()> {
        if self.file_cache.path.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "file_cache_path is required".to_string(),
            ));
        }
        if self.cache_flush_filename.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "cache_flush_filename must not be empty".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for segment in &self.shm_segments {
            if !names.insert(segment.name.as_str()) {
                return Err(CacheError::DuplicateName(segment.name.clone()));
            }
            if segment.size_kb == 0 {
                return Err(CacheError::InvalidConfiguration(format!(
                    "shm segment {} has zero size",
                    segment.name
                )));
            }
        }
        Ok(())
    }

    /// Which remote tier to build, applying the Redis-over-memcached
    /// precedence rule.
    pub fn remote_backend(&self) -> RemoteBackendChoice {
        match (&self.redis_server, self.memcached_servers.is_empty()) {
            (Some(server), memcached_unset) => {
                if !memcached_unset {
                    warn!("both redis_server and memcached_servers set, using Redis");
                }
                RemoteBackendChoice::Redis {
                    server: server.clone(),
                    timeout: Duration::from_micros(self.redis_timeout_us),
                    reconnection_delay: Duration::from_millis(self.redis_reconnection_delay_ms),
                }
            }
            (None, false) => RemoteBackendChoice::Memcached {
                servers: self.memcached_servers.clone(),
                timeout: Duration::from_micros(self.memcached_timeout_us),
            },
            (None, true) => RemoteBackendChoice::None,
        }
    }

    /// Worker threads dedicated to remote I/O. More than one is clamped:
    /// a single sequence already serializes the connection.
    pub fn remote_io_threads(&self) -> u64 {
        if self.memcached_threads > 1 {
            warn!(
                requested = self.memcached_threads,
                "memcached_threads clamped to 1"
            );
            1
        } else {
            self.memcached_threads
        }
    }

    /// Flush-file poll cadence as the purge subsystem consumes it.
    pub fn flush_poll_interval(&self) -> Duration {
        Duration::from_secs(self.cache_flush_poll_interval_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn valid_config() -> CacheConfig {
        CacheConfig {
            file_cache: FileCacheSettings {
                path: PathBuf::from("/var/cache/pagewarp"),
                ..FileCacheSettings::default()
            },
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_default_requires_file_cache_path() {
        assert!(matches!(
            CacheConfig::default().validate(),
            Err(CacheError::InvalidConfiguration(_))
        ));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_duplicate_shm_segment_name() {
        let mut config = valid_config();
        config.shm_segments = vec![
            ShmSegmentSettings {
                name: "metadata".to_string(),
                size_kb: 64,
            },
            ShmSegmentSettings {
                name: "metadata".to_string(),
                size_kb: 128,
            },
        ];
        assert!(matches!(
            config.validate(),
            Err(CacheError::DuplicateName(name)) if name == "metadata"
        ));
    }

    #[test]
    fn test_merge_prefers_larger_size_smaller_interval() {
        let mut ours = FileCacheSettings {
            path: PathBuf::from("/var/cache/pagewarp"),
            clean_size_kb: 100,
            clean_inode_limit: 0,
            clean_interval_ms: 60_000,
        };
        ours.merge(&FileCacheSettings {
            path: PathBuf::from("/var/cache/pagewarp"),
            clean_size_kb: 500,
            clean_inode_limit: 10_000,
            clean_interval_ms: 120_000,
        });
        assert_eq!(ours.clean_size_kb, 500);
        assert_eq!(ours.clean_interval_ms, 60_000);
        assert_eq!(ours.clean_inode_limit, 10_000);
    }

    #[test]
    fn test_merge_inode_limits_smaller_nonzero_wins() {
        let mut ours = FileCacheSettings {
            clean_inode_limit: 5_000,
            ..FileCacheSettings::default()
        };
        ours.merge(&FileCacheSettings {
            clean_inode_limit: 2_000,
            ..FileCacheSettings::default()
        });
        assert_eq!(ours.clean_inode_limit, 2_000);
    }

    #[test]
    fn test_redis_takes_precedence() {
        let mut config = valid_config();
        config.memcached_servers = vec!["localhost:11211".to_string()];
        config.redis_server = Some("localhost:6379".to_string());
        assert!(matches!(
            config.remote_backend(),
            RemoteBackendChoice::Redis { server, .. } if server == "localhost:6379"
        ));
    }

    #[test]
    fn test_memcached_when_only_servers_set() {
        let mut config = valid_config();
        config.memcached_servers =
            vec!["a:11211".to_string(), "b:11211".to_string()];
        match config.remote_backend() {
            RemoteBackendChoice::Memcached { servers, timeout } => {
                assert_eq!(servers.len(), 2);
                assert_eq!(timeout, Duration::from_micros(50_000));
            }
            other => panic!("expected memcached, got {other:?}"),
        }
    }

    #[test]
    fn test_no_remote_by_default() {
        assert_eq!(valid_config().remote_backend(), RemoteBackendChoice::None);
    }

    #[test]
    fn test_memcached_threads_clamped() {
        let mut config = valid_config();
        config.memcached_threads = 8;
        assert_eq!(config.remote_io_threads(), 1);
        config.memcached_threads = 0;
        assert_eq!(config.remote_io_threads(), 0);
    }

    #[test]
    fn test_flush_filename_relative() {
        let config = valid_config();
        assert!(Path::new(&config.cache_flush_filename).is_relative());
    }
}
