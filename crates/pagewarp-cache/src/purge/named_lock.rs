//! Advisory cross-process lock backed by a lock file.
//!
//! The lock is cooperative: a crashed holder leaves the file behind, so
//! waiters may steal a lock whose file is older than the steal threshold.
//! Because theft is possible, protected operations must tolerate losing
//! the lock mid-flight (the purge writer does so with its
//! read/modify/write/verify loop).

use crate::error::{CacheError, CacheResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// How often waiters re-check the lock file.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct NamedLock {
    path: PathBuf,
    /// A lock file older than this may be stolen.
    steal_after: Duration,
    /// Waiters give up after this long.
    timeout: Duration,
}

/// Held lock; the file is removed on drop. Owns its path so holding the
/// guard does not borrow the [`NamedLock`] it came from.
#[derive(Debug)]
pub struct NamedLockGuard {
    path: PathBuf,
}

impl NamedLock {
    pub fn new(path: impl Into<PathBuf>, steal_after: Duration, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            steal_after,
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, stealing a stale one, or fail with
    /// [`CacheError::LockTimeout`] after the timeout.
    pub fn acquire(&self) -> CacheResult<NamedLockGuard> {
        let deadline = SystemTime::now() + self.timeout;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(_) => {
                    return Ok(NamedLockGuard {
                        path: self.path.clone(),
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.holder_is_stale() {
                        debug!(path = %self.path.display(), "stealing stale lock file");
                        // Best effort; a racing stealer may get there first
                        // and the retry loop sorts it out.
                        let _ = fs::remove_file(&self.path);
                        continue;
                    }
                }
                Err(err) => return Err(CacheError::Io(err)),
            }
            if SystemTime::now() >= deadline {
                return Err(CacheError::LockTimeout(
                    self.path.display().to_string(),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn holder_is_stale(&self) -> bool {
        let Ok(metadata) = fs::metadata(&self.path) else {
            // Gone already; the acquire loop will retry the create.
            return false;
        };
        match metadata.modified().map(|mtime| mtime.elapsed()) {
            Ok(Ok(age)) => age >= self.steal_after,
            _ => false,
        }
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(
                path = %self.path.display(),
                %err,
                "failed to remove lock file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir, steal_after: Duration, timeout: Duration) -> NamedLock {
        NamedLock::new(dir.path().join("purge-lock"), steal_after, timeout)
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().expect("tempdir");
        let lock = lock_in(&dir, Duration::from_secs(2), Duration::from_secs(3));
        {
            let _guard = lock.acquire().expect("uncontended acquire");
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_contended_acquire_times_out() {
        let dir = TempDir::new().expect("tempdir");
        let lock = lock_in(&dir, Duration::from_secs(60), Duration::from_millis(100));
        let _guard = lock.acquire().expect("uncontended acquire");

        let second = lock_in(&dir, Duration::from_secs(60), Duration::from_millis(100));
        match second.acquire() {
            Err(CacheError::LockTimeout(_)) => {}
            other => panic!("expected LockTimeout, got {other:?}"),
        };
    }

    #[test]
    fn test_guard_outlives_borrow_of_lock() {
        let dir = TempDir::new().expect("tempdir");
        let guard = {
            let lock = lock_in(&dir, Duration::from_secs(2), Duration::from_secs(3));
            lock.acquire().expect("uncontended acquire")
        };
        // The lock struct is gone; the guard still releases the file.
        assert!(dir.path().join("purge-lock").exists());
        drop(guard);
        assert!(!dir.path().join("purge-lock").exists());
    }

    #[test]
    fn test_stale_lock_is_stolen() {
        let dir = TempDir::new().expect("tempdir");
        // Simulate a crashed holder: lock file exists, nobody releases it.
        let path = dir.path().join("purge-lock");
        fs::write(&path, b"").expect("plant stale lock file");

        let lock = NamedLock::new(&path, Duration::ZERO, Duration::from_secs(3));
        let _guard = lock.acquire().expect("steal should succeed");
    }

    #[test]
    fn test_sequential_acquires() {
        let dir = TempDir::new().expect("tempdir");
        let lock = lock_in(&dir, Duration::from_secs(2), Duration::from_secs(3));
        for _ in 0..3 {
            let _guard = lock.acquire().expect("re-acquire after release");
        }
    }
}
