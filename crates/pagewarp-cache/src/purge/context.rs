//! Cross-process purge coordination around a single purge file.
//!
//! Any worker may request a per-URL or global invalidation. Requests
//! batch in memory and a single writer task, run on a worker-pool
//! sequence, folds them into the file under an advisory named lock.
//! Because the lock can be stolen, the writer never assumes exclusivity:
//! it re-reads, merges, writes atomically, and then verifies the bytes
//! on disk, retrying a bounded number of times when a peer raced it.
//!
//! Readers never take the lock. They poll on a cadence, short-circuited
//! by a shared purge-index counter that writers bump after every
//! successful write, so peers that see the index move re-read on their
//! very next poll.

use crate::clock::now_ms;
use crate::error::CacheError;
use crate::purge::named_lock::NamedLock;
use crate::purge::set::PurgeSet;
use crate::purge::shared_counter::SharedCounter;
use crate::sequencer::{task_fn, Sequence};
use crate::stats::PurgeStats;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Minimum interval between file polls when the purge index is quiet.
pub const CHECK_CACHE_INTERVAL_MS: i64 = 5000;
/// A purge-file lock older than this is considered abandoned.
pub const STEAL_LOCK_AFTER_MS: u64 = 2000;
/// How long the writer waits for the lock before cancelling the batch.
pub const LOCK_TIMEOUT_MS: u64 = 3000;
/// Write or verify failures tolerated before pending purges are failed.
pub const MAX_CONTENTION_RETRIES: u32 = 2;

/// Completion of one purge request: success flag and a reason on failure.
pub type PurgeCallback = Box<dyn FnOnce(bool, &str) + Send>;

/// Invoked with the freshly installed purge set whenever it changes, so
/// the owner can drop or revalidate affected cache entries. Runs outside
/// every purge-context mutex.
pub type UpdateCallback = Box<dyn Fn(&PurgeSet) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PurgeContextOptions {
    /// Per-URL purging. When false the context runs in legacy mode: the
    /// purge file's mtime is the global invalidation timestamp and its
    /// contents are ignored.
    pub enable_purge: bool,
    /// Byte bound for the in-memory purge sets.
    pub max_bytes_in_cache: usize,
    /// How long the writer parks before taking the lock, letting nearby
    /// requests ride the same file write. Zero writes immediately.
    pub request_batching_delay_ms: u64,
    pub check_cache_interval_ms: i64,
    pub steal_lock_after_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_contention_retries: u32,
}

impl Default for PurgeContextOptions {
    fn default() -> Self {
        Self {
            enable_purge: true,
            max_bytes_in_cache: 1024 * 1024,
            request_batching_delay_ms: 0,
            check_cache_interval_ms: CHECK_CACHE_INTERVAL_MS,
            steal_lock_after_ms: STEAL_LOCK_AFTER_MS,
            lock_timeout_ms: LOCK_TIMEOUT_MS,
            max_contention_retries: MAX_CONTENTION_RETRIES,
        }
    }
}

struct PurgeContextState {
    /// Purges accumulated since the last writer dispatch.
    pending: PurgeSet,
    pending_callbacks: Vec<PurgeCallback>,
    /// A writer task is scheduled or running.
    writer_in_flight: bool,
    /// A poll is re-reading the file.
    reading: bool,
    num_consecutive_failures: u32,
    last_file_check_ms: i64,
    /// Snapshot of the shared purge index at the last poll.
    local_purge_index: i64,
    /// Purge-file mtime at the last poll, for change detection and for
    /// legacy mode's global timestamp.
    last_mtime_ms: i64,
}

pub struct PurgeContext {
    filename: PathBuf,
    lock: NamedLock,
    purge_index: SharedCounter,
    options: PurgeContextOptions,
    sequence: Arc<Sequence>,
    stats: Arc<PurgeStats>,
    state: Mutex<PurgeContextState>,
    /// The installed purge set, swapped wholesale on change so readers
    /// hold a consistent snapshot without locking the context.
    installed: Mutex<Arc<PurgeSet>>,
    update_callback: Mutex<Option<UpdateCallback>>,
    /// Test seam: runs after the atomic write, before the verify re-read.
    #[cfg(test)]
    pub(crate) after_write_hook: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl PurgeContext {
    pub fn new(
        filename: impl Into<PathBuf>,
        options: PurgeContextOptions,
        sequence: Arc<Sequence>,
    ) -> Result<Arc<Self>, CacheError> {
        let filename = filename.into();
        let lock = NamedLock::new(
            lock_path(&filename),
            Duration::from_millis(options.steal_lock_after_ms),
            Duration::from_millis(options.lock_timeout_ms),
        );
        let purge_index = SharedCounter::open(&index_path(&filename))?;
        let max_bytes = options.max_bytes_in_cache;
        Ok(Arc::new(Self {
            filename,
            lock,
            purge_index,
            options,
            sequence,
            stats: Arc::new(PurgeStats::default()),
            state: Mutex::new(PurgeContextState {
                pending: PurgeSet::new(max_bytes),
                pending_callbacks: Vec::new(),
                writer_in_flight: false,
                reading: false,
                num_consecutive_failures: 0,
                last_file_check_ms: 0,
                local_purge_index: 0,
                last_mtime_ms: 0,
            }),
            installed: Mutex::new(Arc::new(PurgeSet::new(max_bytes))),
            update_callback: Mutex::new(None),
            #[cfg(test)]
            after_write_hook: Mutex::new(None),
        }))
    }

    /// Register the listener for installed purge-set changes.
    pub fn set_update_callback(&self, callback: UpdateCallback) {
        *self.update_callback.lock() = Some(callback);
    }

    pub fn stats(&self) -> &PurgeStats {
        &self.stats
    }

    /// Current value of the cross-process purge index.
    pub fn purge_index(&self) -> i64 {
        self.purge_index.value()
    }

    /// Snapshot of the installed purge set.
    pub fn purge_set(&self) -> Arc<PurgeSet> {
        Arc::clone(&self.installed.lock())
    }

    /// Is a response for `url` captured at `timestamp_ms` still usable?
    pub fn is_valid(&self, url: &str, timestamp_ms: i64) -> bool {
        self.purge_set().is_valid(url, timestamp_ms)
    }

    /// Request invalidation of `url` for anything captured at or before
    /// `timestamp_ms`. The callback reports durability of the write.
    pub fn add_purge_url(self: &Arc<Self>, url: &str, timestamp_ms: i64, callback: PurgeCallback) {
        if !self.options.enable_purge {
            callback(false, "disabled");
            return;
        }
        let now = now_ms();
        let schedule = {
            let mut state = self.state.lock();
            state.pending.put(url, timestamp_ms, now);
            state.pending_callbacks.push(callback);
            self.claim_writer_slot(&mut state)
        };
        if schedule {
            self.schedule_writer();
        }
    }

    /// Request global invalidation of everything captured at or before
    /// `timestamp_ms`.
    pub fn set_cache_purge_global_timestamp_ms(
        self: &Arc<Self>,
        timestamp_ms: i64,
        callback: PurgeCallback,
    ) {
        if !self.options.enable_purge {
            callback(false, "disabled");
            return;
        }
        let now = now_ms();
        let schedule = {
            let mut state = self.state.lock();
            state
                .pending
                .update_global_invalidation_timestamp_ms(timestamp_ms, now);
            state.pending_callbacks.push(callback);
            self.claim_writer_slot(&mut state)
        };
        if schedule {
            self.schedule_writer();
        }
    }

    fn claim_writer_slot(&self, state: &mut PurgeContextState) -> bool {
        if state.writer_in_flight {
            false
        } else {
            state.writer_in_flight = true;
            true
        }
    }

    fn schedule_writer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancelled = Arc::clone(self);
        self.sequence.add(task_fn(
            move || this.run_writer(),
            move || cancelled.writer_cancelled(),
        ));
    }

    /// Cancel arm: the pool is shutting down, fail the batch.
    fn writer_cancelled(&self) {
        self.stats.cancellations.add(1);
        let callbacks = {
            let mut state = self.state.lock();
            state.writer_in_flight = false;
            state.pending = PurgeSet::new(self.options.max_bytes_in_cache);
            std::mem::take(&mut state.pending_callbacks)
        };
        for callback in callbacks {
            callback(false, "shutdown");
        }
    }

    fn run_writer(self: Arc<Self>) {
        if self.options.request_batching_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.options.request_batching_delay_ms));
        }
        let guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(err) => {
                debug!(%err, "purge writer failed to take the lock");
                self.stats.cancellations.add(1);
                let callbacks = {
                    let mut state = self.state.lock();
                    state.writer_in_flight = false;
                    state.pending = PurgeSet::new(self.options.max_bytes_in_cache);
                    std::mem::take(&mut state.pending_callbacks)
                };
                for callback in callbacks {
                    callback(false, "timeout");
                }
                return;
            }
        };

        let now = now_ms();
        let contents = fs::read_to_string(&self.filename).unwrap_or_default();
        let (mut merged, parse_failures) =
            PurgeSet::parse(&contents, now, self.options.max_bytes_in_cache);
        self.stats.file_parse_failures.add(parse_failures);

        // Fold the batch in and take ownership of its callbacks. The
        // pending set is kept aside untouched so it can be re-queued if
        // the write is lost.
        let (drained_pending, callbacks, serialized) = {
            let mut state = self.state.lock();
            let drained =
                std::mem::replace(&mut state.pending, PurgeSet::new(self.options.max_bytes_in_cache));
            let callbacks = std::mem::take(&mut state.pending_callbacks);
            state.writer_in_flight = false;
            merged.merge(&drained);
            let serialized = merged.serialize();
            (drained, callbacks, serialized)
        };

        let verified = self.write_and_verify(&serialized);
        drop(guard);

        if verified {
            self.stats.file_writes.add(1);
            self.purge_index.increment();
            self.state.lock().num_consecutive_failures = 0;
            self.install(Arc::new(merged));
            for callback in callbacks {
                callback(true, "");
            }
        } else {
            self.stats.file_write_failures.add(1);
            let (failed_callbacks, reschedule) = {
                let mut state = self.state.lock();
                state.num_consecutive_failures += 1;
                if state.num_consecutive_failures <= self.options.max_contention_retries {
                    // Re-queue the failed batch without displacing purges
                    // or callbacks that arrived while the write was in
                    // flight.
                    state.pending.merge(&drained_pending);
                    let mut requeued = callbacks;
                    requeued.append(&mut state.pending_callbacks);
                    state.pending_callbacks = requeued;
                    state.writer_in_flight = true;
                    (Vec::new(), true)
                } else {
                    // Give up on this batch only. Purges accepted during
                    // the write keep their slot in `pending`; the add that
                    // found the writer slot free has already scheduled the
                    // run that will flush them.
                    state.num_consecutive_failures = 0;
                    (callbacks, false)
                }
            };
            if reschedule {
                self.schedule_writer();
            }
            for callback in failed_callbacks {
                callback(false, "");
            }
        }
    }

    /// Temp-file write, atomic rename, then byte-for-byte verify against
    /// a re-read. A mismatch means a peer stole the lock and wrote over
    /// us; the caller merges and retries.
    fn write_and_verify(&self, serialized: &str) -> bool {
        let temp = self.filename.with_extension("tmp");
        let written = fs::write(&temp, serialized)
            .and_then(|()| fs::rename(&temp, &self.filename));
        if let Err(err) = written {
            warn!(file = %self.filename.display(), %err, "purge file write failed");
            return false;
        }
        #[cfg(test)]
        if let Some(hook) = self.after_write_hook.lock().as_mut() {
            hook();
        }
        match fs::read_to_string(&self.filename) {
            Ok(reread) if reread == serialized => true,
            Ok(_) => {
                self.stats.contentions.add(1);
                debug!(file = %self.filename.display(), "purge file verify mismatch");
                false
            }
            Err(err) => {
                warn!(file = %self.filename.display(), %err, "purge file verify read failed");
                false
            }
        }
    }

    /// Re-read the purge file if the shared index moved or the poll
    /// interval elapsed. Called once per request; cheap when idle.
    pub fn poll_file_system(&self) {
        let now = now_ms();
        let index = self.purge_index.value();
        {
            let mut state = self.state.lock();
            let index_moved = index != state.local_purge_index;
            let interval_elapsed =
                now - state.last_file_check_ms >= self.options.check_cache_interval_ms;
            if state.reading || (!index_moved && !interval_elapsed) {
                return;
            }
            state.reading = true;
            state.local_purge_index = index;
            state.last_file_check_ms = now;
        }

        self.stats.file_stats.add(1);
        let mtime = file_mtime_ms(&self.filename);
        let installed = if self.options.enable_purge {
            self.read_purge_set(now)
        } else {
            self.legacy_mtime_set(mtime)
        };
        {
            let mut state = self.state.lock();
            state.reading = false;
            state.last_mtime_ms = mtime;
        }
        if let Some(set) = installed {
            self.install(set);
        }
    }

    fn read_purge_set(&self, now: i64) -> Option<Arc<PurgeSet>> {
        let contents = fs::read_to_string(&self.filename).unwrap_or_default();
        let (parsed, parse_failures) =
            PurgeSet::parse(&contents, now, self.options.max_bytes_in_cache);
        self.stats.file_parse_failures.add(parse_failures);
        if self.purge_set().equals(&parsed) {
            None
        } else {
            Some(Arc::new(parsed))
        }
    }

    /// Legacy mode: the file's mtime is the global invalidation
    /// timestamp; contents are ignored.
    fn legacy_mtime_set(&self, mtime_ms: i64) -> Option<Arc<PurgeSet>> {
        if mtime_ms == 0 || self.purge_set().global_invalidation_timestamp_ms() >= mtime_ms {
            return None;
        }
        let mut set = PurgeSet::new(self.options.max_bytes_in_cache);
        set.update_global_invalidation_timestamp_ms(
            mtime_ms,
            now_ms().saturating_add(crate::purge::set::CLOCK_SKEW_ALLOWANCE_MS),
        );
        Some(Arc::new(set))
    }

    /// Swap in a new purge set and notify the listener, outside every
    /// context mutex.
    fn install(&self, set: Arc<PurgeSet>) {
        *self.installed.lock() = Arc::clone(&set);
        let callback = self.update_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(&set);
        }
    }
}

fn lock_path(filename: &Path) -> PathBuf {
    let mut name = filename.as_os_str().to_owned();
    name.push("-lock");
    PathBuf::from(name)
}

fn index_path(filename: &Path) -> PathBuf {
    let mut name = filename.as_os_str().to_owned();
    name.push("-index");
    PathBuf::from(name)
}

fn file_mtime_ms(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|mtime| mtime.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|since| i64::try_from(since.as_millis()).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::WorkerPool;
    use std::sync::mpsc;
    use tempfile::TempDir;

    const URL: &str = "http://example.com/a.css";

    struct Fixture {
        _pool: WorkerPool,
        dir: TempDir,
        context: Arc<PurgeContext>,
    }

    fn fixture(options: PurgeContextOptions) -> Fixture {
        let pool = WorkerPool::new(2).expect("pool should start");
        let dir = TempDir::new().expect("tempdir");
        let context = PurgeContext::new(
            dir.path().join("purges"),
            options,
            pool.new_sequence(),
        )
        .expect("context should open");
        Fixture {
            _pool: pool,
            dir,
            context,
        }
    }

    fn capture() -> (PurgeCallback, mpsc::Receiver<(bool, String)>) {
        let (tx, rx) = mpsc::channel();
        let callback: PurgeCallback = Box::new(move |ok, reason| {
            tx.send((ok, reason.to_string())).expect("receiver alive");
        });
        (callback, rx)
    }

    #[test]
    fn test_add_purge_url_is_durable() {
        let f = fixture(PurgeContextOptions::default());
        let now = now_ms();
        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now, callback);
        assert_eq!(rx.recv().expect("callback ran"), (true, String::new()));

        assert!(!f.context.is_valid(URL, now));
        assert!(f.context.is_valid(URL, now + 1));
        assert!(f.context.is_valid("http://example.com/b.css", now));
        assert_eq!(f.context.purge_index(), 1);
        assert_eq!(f.context.stats().file_writes.get(), 1);

        let contents =
            fs::read_to_string(f.dir.path().join("purges")).expect("purge file exists");
        assert!(contents.contains(URL));
    }

    #[test]
    fn test_purge_disabled() {
        let f = fixture(PurgeContextOptions {
            enable_purge: false,
            ..PurgeContextOptions::default()
        });
        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now_ms(), callback);
        assert_eq!(rx.recv().expect("callback ran"), (false, "disabled".to_string()));
        assert_eq!(f.context.stats().file_writes.get(), 0);
    }

    #[test]
    fn test_global_purge() {
        let f = fixture(PurgeContextOptions::default());
        let now = now_ms();
        let (callback, rx) = capture();
        f.context.set_cache_purge_global_timestamp_ms(now, callback);
        assert_eq!(rx.recv().expect("callback ran"), (true, String::new()));
        assert!(!f.context.is_valid(URL, now));
        assert!(!f.context.is_valid("http://example.com/other", now - 5000));
        assert!(f.context.is_valid(URL, now + 1));
    }

    #[test]
    fn test_batching_delay_coalesces_writes() {
        let f = fixture(PurgeContextOptions {
            request_batching_delay_ms: 50,
            ..PurgeContextOptions::default()
        });
        let now = now_ms();
        let receivers: Vec<_> = (0..3)
            .map(|i| {
                let (callback, rx) = capture();
                f.context
                    .add_purge_url(&format!("http://example.com/{i}.css"), now, callback);
                rx
            })
            .collect();
        for rx in receivers {
            assert_eq!(rx.recv().expect("callback ran"), (true, String::new()));
        }
        assert_eq!(f.context.stats().file_writes.get(), 1);
        assert_eq!(f.context.purge_set().num_urls(), 3);
    }

    #[test]
    fn test_peer_observes_purge_via_index() {
        let f = fixture(PurgeContextOptions::default());
        let pool = WorkerPool::new(1).expect("pool should start");
        let peer = PurgeContext::new(
            f.dir.path().join("purges"),
            PurgeContextOptions::default(),
            pool.new_sequence(),
        )
        .expect("peer context should open");

        let now = now_ms();
        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now, callback);
        assert!(rx.recv().expect("callback ran").0);

        assert!(peer.is_valid(URL, now), "peer has not polled yet");
        // The shared index moved, so the very next poll re-reads the file
        // regardless of the poll interval.
        peer.poll_file_system();
        assert!(!peer.is_valid(URL, now));
    }

    #[test]
    fn test_verify_mismatch_merges_and_retries() {
        let f = fixture(PurgeContextOptions::default());
        let now = now_ms();
        let peer_line = format!("-1\n{} http://example.com/peer.css\n", now);
        let purge_file = f.dir.path().join("purges");
        {
            let mut fired = false;
            *f.context.after_write_hook.lock() = Some(Box::new(move || {
                if !fired {
                    fired = true;
                    // A peer stole the lock and replaced the file between
                    // our write and our verify.
                    fs::write(&purge_file, &peer_line).expect("peer write");
                }
            }));
        }

        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now, callback);
        assert_eq!(rx.recv().expect("callback ran"), (true, String::new()));

        assert_eq!(f.context.stats().contentions.get(), 1);
        assert_eq!(f.context.stats().file_write_failures.get(), 1);
        assert_eq!(f.context.stats().file_writes.get(), 1);
        // Nothing was lost: the retry merged the peer's purge with ours.
        assert!(!f.context.is_valid(URL, now));
        assert!(!f.context.is_valid("http://example.com/peer.css", now));
    }

    #[test]
    fn test_purge_during_contended_write_keeps_its_callback() {
        let f = fixture(PurgeContextOptions::default());
        let now = now_ms();
        let purge_file = f.dir.path().join("purges");
        let (late_callback, late_rx) = capture();
        {
            // While the first batch is between its write and its verify, a
            // peer replaces the file and a new purge request arrives.
            let context = Arc::downgrade(&f.context);
            let mut late = Some(late_callback);
            let peer_line = format!("-1\n{} http://example.com/peer.css\n", now);
            *f.context.after_write_hook.lock() = Some(Box::new(move || {
                let Some(callback) = late.take() else {
                    return;
                };
                fs::write(&purge_file, &peer_line).expect("peer write");
                if let Some(context) = context.upgrade() {
                    context.add_purge_url("http://example.com/late.css", now, callback);
                }
            }));
        }

        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now, callback);
        assert_eq!(rx.recv().expect("first callback ran"), (true, String::new()));
        assert_eq!(
            late_rx.recv().expect("late callback ran"),
            (true, String::new())
        );

        // All three purges survive the contended retry.
        assert!(!f.context.is_valid(URL, now));
        assert!(!f.context.is_valid("http://example.com/peer.css", now));
        assert!(!f.context.is_valid("http://example.com/late.css", now));
    }

    #[test]
    fn test_write_failure_exhausts_retries() {
        let f = fixture(PurgeContextOptions::default());
        // A directory squatting on the purge filename makes the atomic
        // rename fail on every attempt.
        fs::create_dir(f.dir.path().join("purges")).expect("squatting dir");

        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now_ms(), callback);
        assert_eq!(rx.recv().expect("callback ran"), (false, String::new()));
        assert_eq!(f.context.stats().file_write_failures.get(), 3);
        assert_eq!(f.context.stats().file_writes.get(), 0);
    }

    #[test]
    fn test_lock_timeout_cancels_batch() {
        let f = fixture(PurgeContextOptions {
            steal_lock_after_ms: 60_000,
            lock_timeout_ms: 100,
            ..PurgeContextOptions::default()
        });
        // A fresh lock file from a live peer that never releases it.
        fs::write(f.dir.path().join("purges-lock"), b"").expect("plant lock");

        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now_ms(), callback);
        assert_eq!(rx.recv().expect("callback ran"), (false, "timeout".to_string()));
        assert_eq!(f.context.stats().cancellations.get(), 1);
        // The discarded purge never became visible.
        assert!(f.context.is_valid(URL, now_ms() - 1000));
    }

    #[test]
    fn test_update_callback_fires_on_install() {
        let f = fixture(PurgeContextOptions::default());
        let updates = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let updates = Arc::clone(&updates);
            f.context.set_update_callback(Box::new(move |set| {
                assert!(set.num_urls() > 0 || set.has_global_invalidation_timestamp());
                updates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        let (callback, rx) = capture();
        f.context.add_purge_url(URL, now_ms(), callback);
        assert!(rx.recv().expect("callback ran").0);
        assert_eq!(updates.load(std::sync::atomic::Ordering::SeqCst), 1);

        // An unchanged file does not reinstall.
        f.context.poll_file_system();
        assert_eq!(updates.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_legacy_mtime_flush() {
        let f = fixture(PurgeContextOptions {
            enable_purge: false,
            ..PurgeContextOptions::default()
        });
        let flushed_at = now_ms();
        fs::write(f.dir.path().join("purges"), b"").expect("touch purge file");

        f.context.poll_file_system();
        let set = f.context.purge_set();
        assert!(set.has_global_invalidation_timestamp());
        assert!(!f.context.is_valid(URL, flushed_at - 1000));
        assert!(f.context.is_valid(URL, flushed_at + 60_000));
    }
}
