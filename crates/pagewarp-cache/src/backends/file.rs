//! Bounded on-disk cache: one file per entry under a hashed directory
//! tree, with a periodic cleaner that evicts oldest-first when the tree
//! outgrows its size or inode budget.
//!
//! Entries are stored at `<root>/<hh>/<md5-hex>` where `hh` is the first
//! hex byte of the key's digest. Writes go to a temp file in the target
//! directory and are renamed into place, so readers never observe a
//! partial value. Cleaning coordinates across processes with the same
//! named-lock scheme the purge writer uses, plus a clean-time file that
//! records when the next clean is due.

use crate::clock::{now_ms, system_time_ms};
use crate::error::CacheResult;
use crate::interface::BlockingStore;
use crate::purge::NamedLock;
use crate::stats::FileCacheStats;
use crate::value::SharedValue;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Records when the next clean is due, shared between processes.
const CLEAN_TIME_NAME: &str = "!clean!time!";
/// Held by whichever process is currently cleaning.
const CLEAN_LOCK_NAME: &str = "!clean!lock!";

/// After a clean, usage is brought down to this fraction of each budget
/// so back-to-back cleans do not thrash.
const CLEAN_TARGET_NUMERATOR: u64 = 3;
const CLEAN_TARGET_DENOMINATOR: u64 = 4;

#[derive(Debug, Clone)]
pub struct FileCachePolicy {
    /// Byte budget for the whole tree.
    pub target_size_bytes: u64,
    /// Inode budget; 0 means unlimited.
    pub target_inode_count: u64,
    /// How often to consider cleaning; negative disables the cleaner.
    pub clean_interval_ms: i64,
}

pub struct FileCache {
    root: PathBuf,
    policy: FileCachePolicy,
    stats: Arc<FileCacheStats>,
    clean_lock: NamedLock,
    /// In-memory gate so most puts skip the clean-time file read.
    next_clean_check_ms: i64,
    temp_sequence: u64,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>, policy: FileCachePolicy) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let clean_lock = NamedLock::new(
            root.join(CLEAN_LOCK_NAME),
            Duration::from_secs(300),
            Duration::ZERO,
        );
        Ok(Self {
            root,
            policy,
            stats: Arc::new(FileCacheStats::default()),
            clean_lock,
            next_clean_check_ms: 0,
            temp_sequence: 0,
        })
    }

    pub fn stats(&self) -> Arc<FileCacheStats> {
        Arc::clone(&self.stats)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(md5::compute(key.as_bytes()).0);
        self.root.join(&digest[..2]).join(&digest)
    }

    fn write_atomically(&mut self, path: &Path, value: &SharedValue) -> std::io::Result<()> {
        let Some(dir) = path.parent() else {
            return Err(std::io::Error::other("entry path has no parent"));
        };
        fs::create_dir_all(dir)?;
        self.temp_sequence += 1;
        let temp = dir.join(format!(
            "!temp!{}.{}",
            std::process::id(),
            self.temp_sequence
        ));
        fs::write(&temp, value.as_bytes())?;
        fs::rename(&temp, path)
    }

    /// Put-path hook: consult the clean-time file at most once per
    /// interval, and clean when it says a clean is due and no other
    /// process is already doing it.
    fn check_clean(&mut self) {
        if self.policy.clean_interval_ms < 0 {
            return;
        }
        let now = now_ms();
        if now < self.next_clean_check_ms {
            return;
        }
        self.next_clean_check_ms = now + self.policy.clean_interval_ms;
        self.stats.disk_checks.add(1);

        let clean_time_path = self.root.join(CLEAN_TIME_NAME);
        let next_clean_ms = fs::read_to_string(&clean_time_path)
            .ok()
            .and_then(|text| text.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if now < next_clean_ms {
            return;
        }
        let Ok(_guard) = self.clean_lock.acquire() else {
            self.stats.skipped_cleanups.add(1);
            debug!(root = %self.root.display(), "another process is cleaning");
            return;
        };
        let due = now + self.policy.clean_interval_ms;
        if let Err(err) = fs::write(&clean_time_path, due.to_string()) {
            warn!(root = %self.root.display(), %err, "failed to write clean-time file");
        }
        self.stats.started_cleanups.add(1);
        self.clean();
    }

    /// Scan the tree and evict oldest-first down to 3/4 of each budget.
    /// Public so an operator (or test) can force a clean.
    pub fn clean(&mut self) {
        let mut entries: Vec<(PathBuf, u64, i64)> = Vec::new();
        let mut total_bytes = 0u64;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('!'))
            {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime_ms = metadata.modified().map(system_time_ms).unwrap_or(0);
            total_bytes += metadata.len();
            entries.push((entry.into_path(), metadata.len(), mtime_ms));
        }
        let total_inodes = entries.len() as u64;

        let over_bytes = total_bytes > self.policy.target_size_bytes;
        let over_inodes =
            self.policy.target_inode_count > 0 && total_inodes > self.policy.target_inode_count;
        if !over_bytes && !over_inodes {
            return;
        }

        let byte_target =
            self.policy.target_size_bytes * CLEAN_TARGET_NUMERATOR / CLEAN_TARGET_DENOMINATOR;
        let inode_target = if self.policy.target_inode_count == 0 {
            u64::MAX
        } else {
            self.policy.target_inode_count * CLEAN_TARGET_NUMERATOR / CLEAN_TARGET_DENOMINATOR
        };

        entries.sort_by_key(|&(_, _, mtime_ms)| mtime_ms);
        let mut bytes = total_bytes;
        let mut inodes = total_inodes;
        let mut freed = 0u64;
        let mut evicted = 0u64;
        for (path, size, _) in entries {
            if bytes <= byte_target && inodes <= inode_target {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    bytes -= size;
                    inodes -= 1;
                    freed += size;
                    evicted += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to evict cache file");
                }
            }
        }
        self.stats.cleanups.add(1);
        self.stats.evictions.add(evicted);
        self.stats.bytes_freed_in_cleanup.add(freed);
        info!(
            root = %self.root.display(),
            evicted,
            freed,
            remaining_bytes = bytes,
            "file cache cleaned"
        );
    }
}

impl BlockingStore for FileCache {
    fn name(&self) -> String {
        "FileCache".to_string()
    }

    fn get(&mut self, key: &str) -> Option<SharedValue> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Some(SharedValue::from(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(key, %err, "file cache read failed");
                None
            }
        }
    }

    fn put(&mut self, key: &str, value: SharedValue) {
        let path = self.entry_path(key);
        if let Err(err) = self.write_atomically(&path, &value) {
            warn!(key, %err, "file cache write failed");
            return;
        }
        self.check_clean();
    }

    fn delete(&mut self, key: &str) {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(key, %err, "file cache delete failed"),
        }
    }
}
