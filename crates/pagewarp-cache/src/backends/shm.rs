//! Fixed-capacity cache in a file-backed shared-memory segment, usable
//! by every worker process that maps the same file.
//!
//! The segment is divided into sectors, each with its own spinlock, a
//! slot directory, and fixed-size value blocks. A key hashes to one
//! sector and probes a short window of slots; when the window is full
//! the least recently used slot in it is evicted. Slots store only a
//! 64-bit key hash, so the cache cannot verify a hit against the full
//! key by itself: callers must fold the key into the value on put
//! ([`Cache::must_encode_key_in_value`]), and get strips and checks it.
//! Values larger than a block are rejected at put; a fallback composer
//! routes those to a roomier backend.
#![allow(unsafe_code)]

use crate::clock::now_ms;
use crate::codec::decode_value_matching_key;
use crate::error::{CacheError, CacheResult};
use crate::interface::{validate_and_report, Cache, CacheLookup, LookupCallback};
use crate::value::SharedValue;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Slots a key may occupy within its sector.
const PROBE_WINDOW: usize = 8;
/// Per-sector spinlock plus padding.
const SECTOR_HEADER_BYTES: usize = 8;
/// key hash, last-use time, value length, occupancy flag.
const SLOT_HEADER_BYTES: usize = 24;
/// A sector smaller than this cannot hold a useful probe window.
const MIN_SLOTS_PER_SECTOR: usize = PROBE_WINDOW;

#[derive(Debug, Clone)]
pub struct ShmCachePolicy {
    /// Total segment size.
    pub size_bytes: usize,
    /// Independent locking domains; more sectors, less contention.
    pub num_sectors: usize,
    /// Fixed capacity of one value block, including the key-in-value
    /// framing. This is the backend's max value size.
    pub block_size: usize,
}

impl Default for ShmCachePolicy {
    fn default() -> Self {
        Self {
            size_bytes: 512 * 1024,
            num_sectors: 4,
            block_size: 4096,
        }
    }
}

pub struct ShmCache {
    map: MmapMut,
    name: String,
    num_sectors: usize,
    sector_stride: usize,
    slots_per_sector: usize,
    block_size: usize,
    shutdown: AtomicBool,
}

fn key_hash(key: &str) -> u64 {
    let digest = md5::compute(key.as_bytes()).0;
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

struct SlotHeader {
    key_hash: u64,
    last_use_ms: i64,
    value_len: u32,
    occupied: u32,
}

impl ShmCache {
    /// Map (creating if needed) the segment at `path`. Fails with
    /// [`CacheError::SegmentTooSmall`] when `size_bytes` cannot hold a
    /// probe window per sector.
    pub fn new(path: &Path, name: impl Into<String>, policy: &ShmCachePolicy) -> CacheResult<Self> {
        if policy.num_sectors == 0 || policy.block_size == 0 {
            return Err(CacheError::InvalidConfiguration(
                "shm cache needs at least one sector and a nonzero block size".to_string(),
            ));
        }
        let slot_stride = SLOT_HEADER_BYTES + policy.block_size;
        // Keep sector bases 8-byte aligned so the spinlock atomics are too.
        let sector_stride = (policy.size_bytes / policy.num_sectors) & !7;
        let slots_per_sector = sector_stride
            .saturating_sub(SECTOR_HEADER_BYTES)
            .checked_div(slot_stride)
            .unwrap_or(0);
        if slots_per_sector < MIN_SLOTS_PER_SECTOR {
            let minimum = policy.num_sectors
                * (SECTOR_HEADER_BYTES + MIN_SLOTS_PER_SECTOR * slot_stride + 8);
            return Err(CacheError::SegmentTooSmall {
                requested: policy.size_bytes,
                minimum,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let existing_len = file.metadata()?.len();
        if existing_len != 0 && existing_len != policy.size_bytes as u64 {
            // A peer mapped this file with different geometry; slot
            // arithmetic would disagree between the processes.
            return Err(CacheError::SegmentCorrupt(format!(
                "segment {} is {existing_len} bytes, policy wants {}",
                path.display(),
                policy.size_bytes
            )));
        }
        file.set_len(policy.size_bytes as u64)?;
        // SAFETY: the mapping lives as long as `self`, and all access is
        // bounds-checked slot arithmetic below.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            name: name.into(),
            num_sectors: policy.num_sectors,
            sector_stride,
            slots_per_sector,
            block_size: policy.block_size,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Largest value accepted by put, after key-in-value framing.
    pub fn max_value_size(&self) -> usize {
        self.block_size
    }

    fn sector_offset(&self, sector: usize) -> usize {
        sector * self.sector_stride
    }

    fn slot_offset(&self, sector: usize, slot: usize) -> usize {
        self.sector_offset(sector)
            + SECTOR_HEADER_BYTES
            + slot * (SLOT_HEADER_BYTES + self.block_size)
    }

    fn sector_lock(&self, sector: usize) -> &AtomicU32 {
        // SAFETY: the offset is within the mapping and 8-byte aligned
        // (sector offsets are multiples of the page-aligned base).
        unsafe {
            &*self
                .map
                .as_ptr()
                .add(self.sector_offset(sector))
                .cast::<AtomicU32>()
        }
    }

    fn lock_sector(&self, sector: usize) -> SectorGuard<'_> {
        let lock = self.sector_lock(sector);
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SectorGuard { lock }
    }

    fn read_slot_header(&self, offset: usize) -> SlotHeader {
        let bytes = &self.map[offset..offset + SLOT_HEADER_BYTES];
        SlotHeader {
            key_hash: u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default()),
            last_use_ms: i64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default()),
            value_len: u32::from_le_bytes(bytes[16..20].try_into().unwrap_or_default()),
            occupied: u32::from_le_bytes(bytes[20..24].try_into().unwrap_or_default()),
        }
    }

    fn write_slot(&self, offset: usize, header: &SlotHeader, value: &[u8]) {
        // SAFETY: writes stay within [offset, offset + slot stride), which
        // the probe arithmetic keeps inside the mapping, and the sector
        // spinlock serializes them against readers.
        unsafe {
            let base = self.map.as_ptr().cast_mut().add(offset);
            base.copy_from_nonoverlapping(header.key_hash.to_le_bytes().as_ptr(), 8);
            base.add(8)
                .copy_from_nonoverlapping(header.last_use_ms.to_le_bytes().as_ptr(), 8);
            base.add(16)
                .copy_from_nonoverlapping(header.value_len.to_le_bytes().as_ptr(), 4);
            base.add(20)
                .copy_from_nonoverlapping(header.occupied.to_le_bytes().as_ptr(), 4);
            if !value.is_empty() {
                base.add(SLOT_HEADER_BYTES)
                    .copy_from_nonoverlapping(value.as_ptr(), value.len());
            }
        }
    }

    fn touch_slot(&self, offset: usize, last_use_ms: i64) {
        // SAFETY: same bounds and locking argument as `write_slot`.
        unsafe {
            let base = self.map.as_ptr().cast_mut().add(offset + 8);
            base.copy_from_nonoverlapping(last_use_ms.to_le_bytes().as_ptr(), 8);
        }
    }

    /// Slot indices to examine for `hash`, relative to its sector.
    fn probe(&self, hash: u64) -> impl Iterator<Item = usize> + '_ {
        let slots = self.slots_per_sector;
        let home = (hash as usize) % slots;
        (0..PROBE_WINDOW.min(slots)).map(move |i| (home + i) % slots)
    }

    /// Copy the value out for `key`, or None. Runs under the sector lock
    /// only long enough to copy the bytes.
    fn lookup(&self, key: &str) -> Option<SharedValue> {
        let hash = key_hash(key);
        let sector = (hash % self.num_sectors as u64) as usize;
        let _guard = self.lock_sector(sector);
        for slot in self.probe(hash) {
            let offset = self.slot_offset(sector, slot);
            let header = self.read_slot_header(offset);
            if header.occupied == 0 || header.key_hash != hash {
                continue;
            }
            let len = header.value_len as usize;
            if len > self.block_size {
                continue;
            }
            let start = offset + SLOT_HEADER_BYTES;
            let blob = SharedValue::from(self.map[start..start + len].to_vec());
            self.touch_slot(offset, now_ms());
            // The hash matched but the embedded key is authoritative.
            return decode_value_matching_key(key, &blob);
        }
        None
    }

    fn store(&self, key: &str, value: &SharedValue) {
        if value.len() > self.block_size {
            debug!(name = %self.name, key, "value exceeds shm block size, dropped");
            return;
        }
        let hash = key_hash(key);
        let sector = (hash % self.num_sectors as u64) as usize;
        let now = now_ms();
        let _guard = self.lock_sector(sector);
        let mut victim: Option<(usize, i64)> = None;
        for slot in self.probe(hash) {
            let offset = self.slot_offset(sector, slot);
            let header = self.read_slot_header(offset);
            if header.occupied == 0 || header.key_hash == hash {
                victim = Some((offset, i64::MIN));
                break;
            }
            if victim.map_or(true, |(_, oldest)| header.last_use_ms < oldest) {
                victim = Some((offset, header.last_use_ms));
            }
        }
        if let Some((offset, _)) = victim {
            self.write_slot(
                offset,
                &SlotHeader {
                    key_hash: hash,
                    last_use_ms: now,
                    value_len: value.len() as u32,
                    occupied: 1,
                },
                value.as_bytes(),
            );
        }
    }

    fn erase(&self, key: &str) {
        let hash = key_hash(key);
        let sector = (hash % self.num_sectors as u64) as usize;
        let _guard = self.lock_sector(sector);
        for slot in self.probe(hash) {
            let offset = self.slot_offset(sector, slot);
            let header = self.read_slot_header(offset);
            if header.occupied != 0 && header.key_hash == hash {
                self.write_slot(
                    offset,
                    &SlotHeader {
                        key_hash: 0,
                        last_use_ms: 0,
                        value_len: 0,
                        occupied: 0,
                    },
                    &[],
                );
            }
        }
    }
}

struct SectorGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for SectorGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

impl Cache for ShmCache {
    fn name(&self) -> String {
        format!("Shm({})", self.name)
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        if self.shutdown.load(Ordering::SeqCst) {
            callback.done(CacheLookup::NotFound);
            return;
        }
        let lookup = self
            .lookup(key)
            .map_or(CacheLookup::NotFound, CacheLookup::Available);
        validate_and_report(key, callback, lookup);
    }

    fn put(&self, key: &str, value: SharedValue) {
        if !self.shutdown.load(Ordering::SeqCst) {
            self.store(key, &value);
        }
    }

    fn delete(&self, key: &str) {
        if !self.shutdown.load(Ordering::SeqCst) {
            self.erase(key);
        }
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn must_encode_key_in_value(&self) -> bool {
        true
    }
}
