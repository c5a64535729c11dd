//! Transparent gzip compression around any cache.
//!
//! Values are compressed on put and decompressed on get. A payload that
//! fails to decompress is counted and reported as a miss rather than an
//! error, matching the contract that corruption is indistinguishable
//! from absence.

use crate::interface::{format_name, Cache, CacheLookup, LookupCallback};
use crate::stats::Counter;
use crate::value::SharedValue;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

use super::put_with_encoding;

/// Byte-level counters for the compression layer.
#[derive(Debug, Default)]
pub struct CompressedCacheStats {
    /// Payloads that failed to decompress on get.
    pub corrupt_payloads: Counter,
    /// Bytes handed to put before compression.
    pub original_size: Counter,
    /// Bytes actually stored after compression.
    pub compressed_size: Counter,
}

pub struct CompressedCache {
    backend: Arc<dyn Cache>,
    stats: Arc<CompressedCacheStats>,
}

impl CompressedCache {
    pub fn new(backend: Arc<dyn Cache>) -> Self {
        Self {
            backend,
            stats: Arc::new(CompressedCacheStats::default()),
        }
    }

    pub fn stats(&self) -> &CompressedCacheStats {
        &self.stats
    }

    fn compress(&self, value: &SharedValue) -> Option<SharedValue> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(value.len() / 2 + 16),
            Compression::default(),
        );
        encoder
            .write_all(value.as_bytes())
            .and_then(|()| encoder.finish())
            .ok()
            .map(SharedValue::from)
    }
}

fn decompress(value: &SharedValue) -> Option<SharedValue> {
    let mut decoder = GzDecoder::new(value.as_bytes());
    let mut out = Vec::with_capacity(value.len() * 2);
    decoder.read_to_end(&mut out).ok().map(|_| SharedValue::from(out))
}

struct DecompressingCallback {
    stats: Arc<CompressedCacheStats>,
    inner: Box<dyn LookupCallback>,
    /// Decompressed candidate, carried from validation to completion so
    /// the payload is only inflated once.
    decompressed: Option<SharedValue>,
}

impl LookupCallback for DecompressingCallback {
    fn validate_candidate(&mut self, key: &str, value: &SharedValue) -> bool {
        match decompress(value) {
            Some(plain) => {
                let valid = self.inner.validate_candidate(key, &plain);
                self.decompressed = Some(plain);
                valid
            }
            None => {
                self.stats.corrupt_payloads.add(1);
                debug!(key, "discarding cache entry that failed to decompress");
                false
            }
        }
    }

    fn done(mut self: Box<Self>, lookup: CacheLookup) {
        let result = match lookup {
            CacheLookup::Available(value) => match self.decompressed.take().or_else(|| {
                decompress(&value)
            }) {
                Some(plain) => CacheLookup::Available(plain),
                None => {
                    self.stats.corrupt_payloads.add(1);
                    CacheLookup::NotFound
                }
            },
            CacheLookup::NotFound => CacheLookup::NotFound,
        };
        self.inner.done(result);
    }
}

impl Cache for CompressedCache {
    fn name(&self) -> String {
        format_name("Compressed", &[&self.backend.name()])
    }

    fn get(&self, key: &str, callback: Box<dyn LookupCallback>) {
        self.backend.get(
            key,
            Box::new(DecompressingCallback {
                stats: Arc::clone(&self.stats),
                inner: callback,
                decompressed: None,
            }),
        );
    }

    fn put(&self, key: &str, value: SharedValue) {
        let Some(compressed) = self.compress(&value) else {
            debug!(key, "dropping put whose value failed to compress");
            return;
        };
        self.stats.original_size.add(value.len() as u64);
        self.stats.compressed_size.add(compressed.len() as u64);
        put_with_encoding(self.backend.as_ref(), key, compressed);
    }

    fn delete(&self, key: &str) {
        self.backend.delete(key);
    }

    fn is_blocking(&self) -> bool {
        self.backend.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.backend.is_healthy()
    }

    fn shut_down(&self) {
        self.backend.shut_down();
    }
}
