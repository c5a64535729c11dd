//! A single atomic counter shared between processes through a
//! memory-mapped file.
//!
//! The purge context bumps this counter after every successful purge-file
//! write; peers compare it against their last snapshot on each poll and
//! re-read the file as soon as it moves, instead of waiting out the poll
//! interval.
#![allow(unsafe_code)]

use crate::error::CacheResult;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

pub struct SharedCounter {
    map: MmapMut,
}

impl SharedCounter {
    /// Map the counter file at `path`, creating it zeroed if absent.
    pub fn open(path: &Path) -> CacheResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(std::mem::size_of::<i64>() as u64)?;
        // SAFETY: the mapping stays valid for the life of `map`, which the
        // returned struct owns alongside every reference handed out.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    fn cell(&self) -> &AtomicI64 {
        // SAFETY: the mapping is page-aligned and at least 8 bytes long,
        // so it holds a properly aligned i64. Cross-process atomicity
        // relies on the file being mapped shared by every participant.
        unsafe { &*self.map.as_ptr().cast::<AtomicI64>() }
    }

    pub fn value(&self) -> i64 {
        self.cell().load(Ordering::SeqCst)
    }

    /// Add one and return the new value.
    pub fn increment(&self) -> i64 {
        self.cell().fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_starts_at_zero_and_counts() {
        let dir = TempDir::new().expect("tempdir");
        let counter = SharedCounter::open(&dir.path().join("index")).expect("open");
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn test_two_mappings_share_state() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("index");
        let a = SharedCounter::open(&path).expect("open a");
        let b = SharedCounter::open(&path).expect("open b");
        a.increment();
        a.increment();
        assert_eq!(b.value(), 2);
        b.increment();
        assert_eq!(a.value(), 3);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("index");
        {
            let counter = SharedCounter::open(&path).expect("open");
            counter.increment();
        }
        let counter = SharedCounter::open(&path).expect("reopen");
        assert_eq!(counter.value(), 1);
    }
}
