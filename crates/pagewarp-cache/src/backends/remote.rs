//! Remote key-value backend over a pluggable client contract.
//!
//! The wire protocol (memcached, Redis) lives behind [`KeyValueClient`];
//! this module owns what the cache core needs from it: sharding a key
//! space across servers, a per-operation timeout, and recoverable health
//! tracking. A burst of client errors inside a checkpoint window flips
//! the cache unhealthy for the remainder of that window, after which the
//! error count starts fresh.
//!
//! Calls run synchronously on the caller's thread, so deployments wrap
//! this backend in the async adapter to keep request threads off the
//! network.

use crate::error::{CacheError, CacheResult};
use crate::interface::{format_name, validate_and_report, Cache, CacheLookup, LookupCallback};
use crate::value::SharedValue;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors into one checkpoint window before health flips false.
pub const DEFAULT_ERROR_BURST_THRESHOLD: u64 = 4;
/// Length of the health checkpoint window.
pub const DEFAULT_HEALTH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("operation timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Contract a protocol framer implements so `RemoteCache` can use it.
/// Implementations honor `timeout` per call and surface every failure
/// as an error, never as a silent miss.
pub trait KeyValueClient: Send + Sync {
    /// "host:port" style identifier, used in the cache name.
    fn server_spec(&self) -> String;

    fn fetch(&self, key: &str, timeout: Duration) -> Result<Option<SharedValue>, RemoteError>;

    fn store(&self, key: &str, value: &SharedValue, timeout: Duration) -> Result<(), RemoteError>;

    fn remove(&self, key: &str, timeout: Duration) -> Result<(), RemoteError>;
}

/// Recoverable unhealth as a timestamped burst count: a checkpoint
/// timestamp and the errors recorded since it. Both move monotonically
/// forward; when `now` passes the window the next error (or health
/// probe) starts a new checkpoint.
struct HealthWindow {
    checkpoint_ms: AtomicI64,
    errors_in_window: AtomicU64,
    window_ms: i64,
    burst_threshold: u64,
}

impl HealthWindow {
    fn new(window: Duration, burst_threshold: u64) -> Self {
        Self {
            checkpoint_ms: AtomicI64::new(crate::clock::now_ms()),
            errors_in_window: AtomicU64::new(0),
            window_ms: window.as_millis() as i64,
            burst_threshold,
        }
    }

    fn roll_window_if_elapsed(&self, now_ms: i64) {
        let checkpoint = self.checkpoint_ms.load(Ordering::Acquire);
        if now_ms - checkpoint >= self.window_ms
            && self
                .checkpoint_ms
                .compare_exchange(checkpoint, now_ms, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.errors_in_window.store(0, Ordering::Release);
        }
    }

    fn record_error(&self, now_ms: i64) {
        self.roll_window_if_elapsed(now_ms);
        self.errors_in_window.fetch_add(1, Ordering::AcqRel);
    }

    fn is_healthy(&self, now_ms: i64) -> bool {
        self.roll_window_if_elapsed(now_ms);
        self.errors_in_window.load(Ordering::Acquire) < self.burst_threshold
    }
}

#[derive(Debug, Clone)]
pub struct RemoteCacheOptions {
    pub operation_timeout: Duration,
    pub health_window: Duration,
    pub error_burst_threshold: u64,
}

impl Default for RemoteCacheOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(50),
            health_window: DEFAULT_HEALTH_WINDOW,
            error_burst_threshold: DEFAULT_ERROR_BURST_THRESHOLD,
        }
    }
}

/// Key-value servers presented as one cache. Keys shard across the
/// clients by hash, so every process mapping the same server list
/// agrees on placement.
pub struct RemoteCache {
    shards: Vec<Box<dyn KeyValueClient>>,
    options: RemoteCacheOptions,
    health: HealthWindow,
    shutdown: AtomicBool,
}

fn shard_hash(key: &str) -> u64 {
    let digest = md5::compute(key.as_bytes()).0;
    u64::from_le_bytes([
        digest[8], digest[9], digest[10], digest[11], digest[12], digest[13], digest[14],
        digest[15],
    ])
}

impl RemoteCache {
    pub fn new(
        shards: Vec<Box<dyn KeyValueClient>>,
        options: RemoteCacheOptions,
    ) -> CacheResult<Self> {
        if shards.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "remote cache needs at least one server".to_string(),
            ));
        }
        let health = HealthWindow::new(options.health_window, options.error_burst_threshold);
        Ok(Self {
            shards,
            options,
            health,
            shutdown: AtomicBool::new(false),
        })
    }

    fn shard_for(&self, key: &str) -> &dyn KeyValueClient {
        let index = (shard_hash(key) % self.shards.len() as u64) as usize;
        self.shards[index].as_ref()
    }

    fn note_error(&self, operation: &str, key: &str, error: &RemoteError) {
        let now = crate::clock::now_ms();
        self.health.record_error(now);
        if !self.health.is_healthy(now) {
            warn!(operation, key, %error, "remote cache unhealthy for the rest of the window");
        }
    }
}

impl Cache for RemoteCache {
    fn name(&self) -> String {
        let specs: Vec<String> = self.shards.iter().map(|s| s.server_spec()).collect();
        format_name("Remote", &specs.iter().map(String::as_str).collect::<Vec<_>>())
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        if !self.is_healthy() {
            callback.done(CacheLookup::NotFound);
            return;
        }
        let lookup = match self.shard_for(key).fetch(key, self.options.operation_timeout) {
            Ok(Some(value)) => CacheLookup::Available(value),
            Ok(None) => CacheLookup::NotFound,
            Err(error) => {
                self.note_error("get", key, &error);
                CacheLookup::NotFound
            }
        };
        validate_and_report(key, callback, lookup);
    }

    fn put(&self, key: &str, value: SharedValue) {
        if !self.is_healthy() {
            return;
        }
        if let Err(error) = self
            .shard_for(key)
            .store(key, &value, self.options.operation_timeout)
        {
            self.note_error("put", key, &error);
        }
    }

    fn delete(&self, key: &str) {
        if !self.is_healthy() {
            return;
        }
        if let Err(error) = self.shard_for(key).remove(key, self.options.operation_timeout) {
            self.note_error("delete", key, &error);
        }
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && self.health.is_healthy(crate::clock::now_ms())
    }

    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
