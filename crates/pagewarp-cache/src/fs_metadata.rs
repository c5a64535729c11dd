//! Validity checks for optimizer inputs against the filesystem.
//!
//! An input record describes where a resource came from: another cache
//! entry with an expiration date, a file on disk with an expected
//! modification time and content hash, or nothing that can go stale.
//! The validator decides whether such a record may still be used,
//! consulting a host-keyed metadata cache so unchanged files are not
//! re-read and re-hashed on every request.

use crate::compose::put_with_encoding;
use crate::error::{CacheError, CacheResult};
use crate::interface::{blocking_get, Cache};
use crate::value::SharedValue;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where an optimized resource's bytes came from, and what must still
/// hold for them to be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRecord {
    /// Served out of a cache at `date_ms`, expiring at `expiration_ms`.
    Cached {
        url: Option<String>,
        date_ms: i64,
        expiration_ms: i64,
    },
    /// Loaded directly from disk. `content_hash` is present when the
    /// metadata cache is enabled, absent when only mtime is tracked.
    FileBased {
        filename: PathBuf,
        last_modified_ms: i64,
        content_hash: Option<String>,
    },
    /// Inputs that cannot go stale (inline data, generated content).
    AlwaysValid,
}

/// Cached per-file state: the mtime observed when the file was last
/// hashed, and the hash itself. Serialized as the metadata cache value.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct FsMetadataEntry {
    last_modified_ms: i64,
    content_hash: String,
}

/// Result of a validity check, with the reasons a caller may need to
/// act on: a purge means the record must be dropped, a stale serve
/// means it is usable now but should be refreshed in the background.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub purged: bool,
    pub stale_serve: bool,
}

impl ValidationOutcome {
    fn valid() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    fn invalid() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    /// Hostname folded into metadata cache keys, so hosts sharing a
    /// cache do not trust each other's file stats.
    pub hostname: String,
    /// How far past expiration a cached input may still be served
    /// (with a background refresh) for top-level rewrites.
    pub staleness_threshold_ms: i64,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            staleness_threshold_ms: 0,
        }
    }
}

pub struct FilesystemMetadataValidator {
    options: ValidatorOptions,
    metadata_cache: Option<Arc<dyn Cache>>,
}

/// Md5 of the file contents, hex-encoded. The same digest the cache
/// stack uses for key hashing.
fn content_hash(bytes: &[u8]) -> String {
    hex::encode(md5::compute(bytes).0)
}

fn file_mtime_ms(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(crate::clock::system_time_ms(modified))
}

impl FilesystemMetadataValidator {
    pub fn new(options: ValidatorOptions) -> Self {
        Self {
            options,
            metadata_cache: None,
        }
    }

    /// Attach the metadata cache. It must be blocking: the validator
    /// runs inline on request threads and cannot wait on a callback.
    pub fn with_metadata_cache(
        options: ValidatorOptions,
        cache: Arc<dyn Cache>,
    ) -> CacheResult<Self> {
        if !cache.is_blocking() {
            return Err(CacheError::InvalidConfiguration(format!(
                "filesystem metadata cache {} is not blocking",
                cache.name()
            )));
        }
        Ok(Self {
            options,
            metadata_cache: Some(cache),
        })
    }

    fn metadata_key(&self, filename: &Path) -> String {
        format!("file://{}{}", self.options.hostname, filename.display())
    }

    /// Decide whether `record` is still usable at `now_ms`.
    /// `url_valid` is the cache-validity predicate, normally backed by
    /// the installed purge set.
    pub fn is_input_valid(
        &self,
        record: &InputRecord,
        now_ms: i64,
        is_nested_rewrite: bool,
        url_valid: &dyn Fn(&str, i64) -> bool,
    ) -> ValidationOutcome {
        match record {
            InputRecord::AlwaysValid => ValidationOutcome::valid(),
            InputRecord::Cached {
                url,
                date_ms,
                expiration_ms,
            } => self.check_cached(
                url.as_deref(),
                *date_ms,
                *expiration_ms,
                now_ms,
                is_nested_rewrite,
                url_valid,
            ),
            InputRecord::FileBased {
                filename,
                last_modified_ms,
                content_hash,
            } => self.check_file_based(filename, *last_modified_ms, content_hash.as_deref()),
        }
    }

    fn check_cached(
        &self,
        url: Option<&str>,
        date_ms: i64,
        expiration_ms: i64,
        now_ms: i64,
        is_nested_rewrite: bool,
        url_valid: &dyn Fn(&str, i64) -> bool,
    ) -> ValidationOutcome {
        if let Some(url) = url {
            if !url_valid(url, date_ms) {
                debug!(url, "cached input dropped by purge");
                return ValidationOutcome {
                    purged: true,
                    ..ValidationOutcome::invalid()
                };
            }
        }
        let remaining_ttl_ms = expiration_ms - now_ms;
        if remaining_ttl_ms > 0 {
            return ValidationOutcome::valid();
        }
        // Expired, but within the staleness allowance it may still be
        // served at the top level while a refresh happens. Nested
        // rewrites never serve stale: the outer rewrite would bake the
        // stale bytes into a fresh entry.
        if remaining_ttl_ms + self.options.staleness_threshold_ms > 0 && !is_nested_rewrite {
            return ValidationOutcome {
                stale_serve: true,
                ..ValidationOutcome::valid()
            };
        }
        ValidationOutcome::invalid()
    }

    fn check_file_based(
        &self,
        filename: &Path,
        expected_mtime_ms: i64,
        expected_hash: Option<&str>,
    ) -> ValidationOutcome {
        let Some(actual_mtime_ms) = file_mtime_ms(filename) else {
            return ValidationOutcome::invalid();
        };
        let Some(cache) = &self.metadata_cache else {
            // Without a metadata cache, mtime equality is the whole check.
            return if actual_mtime_ms == expected_mtime_ms {
                ValidationOutcome::valid()
            } else {
                ValidationOutcome::invalid()
            };
        };
        let Some(expected_hash) = expected_hash else {
            return ValidationOutcome::invalid();
        };

        let key = self.metadata_key(filename);
        if let Some(entry) = self.load_entry(cache.as_ref(), &key) {
            if entry.last_modified_ms == actual_mtime_ms {
                return if entry.content_hash == expected_hash {
                    ValidationOutcome::valid()
                } else {
                    ValidationOutcome::invalid()
                };
            }
        }

        // Entry missing or the file moved under it. Re-read and re-hash,
        // refresh the cache, then judge against the refreshed state.
        let Ok(contents) = fs::read(filename) else {
            return ValidationOutcome::invalid();
        };
        let entry = FsMetadataEntry {
            last_modified_ms: actual_mtime_ms,
            content_hash: content_hash(&contents),
        };
        self.store_entry(cache.as_ref(), &key, &entry);
        if entry.content_hash == expected_hash {
            ValidationOutcome::valid()
        } else {
            ValidationOutcome::invalid()
        }
    }

    fn load_entry(&self, cache: &dyn Cache, key: &str) -> Option<FsMetadataEntry> {
        let value = blocking_get(cache, key)?;
        match serde_json::from_slice(value.as_bytes()) {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(key, %error, "discarding unreadable filesystem metadata entry");
                None
            }
        }
    }

    fn store_entry(&self, cache: &dyn Cache, key: &str, entry: &FsMetadataEntry) {
        match serde_json::to_vec(entry) {
            Ok(serialized) => put_with_encoding(cache, key, SharedValue::from(serialized)),
            Err(error) => warn!(key, %error, "failed to serialize filesystem metadata entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::lru::LruCache;
    use crate::backends::shm::{ShmCache, ShmCachePolicy};
    use crate::clock::now_ms;
    use crate::compose::{StatsCache, ThreadsafeCache};
    use std::io::Write;
    use tempfile::TempDir;

    fn metadata_cache() -> Arc<StatsCache> {
        Arc::new(StatsCache::new(Arc::new(ThreadsafeCache::new(
            LruCache::new(1 << 20),
        ))))
    }

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).expect("create file");
        file.write_all(contents).expect("write file");
        file.sync_all().expect("sync file");
        path
    }

    fn always_valid(_: &str, _: i64) -> bool {
        true
    }

    #[test]
    fn test_always_valid_record() {
        let validator = FilesystemMetadataValidator::new(ValidatorOptions::default());
        let outcome =
            validator.is_input_valid(&InputRecord::AlwaysValid, now_ms(), false, &always_valid);
        assert!(outcome.valid);
        assert!(!outcome.stale_serve);
    }

    #[test]
    fn test_cached_within_ttl() {
        let validator = FilesystemMetadataValidator::new(ValidatorOptions::default());
        let record = InputRecord::Cached {
            url: Some("http://example.com/a.css".to_string()),
            date_ms: 1_000,
            expiration_ms: 10_000,
        };
        assert!(validator.is_input_valid(&record, 5_000, false, &always_valid).valid);
        assert!(!validator.is_input_valid(&record, 10_000, false, &always_valid).valid);
    }

    #[test]
    fn test_cached_stale_serve_window() {
        let validator = FilesystemMetadataValidator::new(ValidatorOptions {
            staleness_threshold_ms: 2_000,
            ..ValidatorOptions::default()
        });
        let record = InputRecord::Cached {
            url: None,
            date_ms: 1_000,
            expiration_ms: 10_000,
        };
        let outcome = validator.is_input_valid(&record, 11_000, false, &always_valid);
        assert!(outcome.valid);
        assert!(outcome.stale_serve);
        // Nested rewrites do not serve stale.
        let nested = validator.is_input_valid(&record, 11_000, true, &always_valid);
        assert!(!nested.valid);
        // Past the allowance nobody does.
        assert!(!validator.is_input_valid(&record, 13_000, false, &always_valid).valid);
    }

    #[test]
    fn test_cached_purged_url() {
        let validator = FilesystemMetadataValidator::new(ValidatorOptions::default());
        let record = InputRecord::Cached {
            url: Some("http://example.com/purged.css".to_string()),
            date_ms: 1_000,
            expiration_ms: i64::MAX,
        };
        let purged_at_2000 = |_: &str, date_ms: i64| date_ms > 2_000;
        let outcome = validator.is_input_valid(&record, 5_000, false, &purged_at_2000);
        assert!(!outcome.valid);
        assert!(outcome.purged);
    }

    #[test]
    fn test_file_based_mtime_only() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "style.css", b"body {}");
        let mtime = file_mtime_ms(&path).expect("file exists");
        let validator = FilesystemMetadataValidator::new(ValidatorOptions::default());
        let fresh = InputRecord::FileBased {
            filename: path.clone(),
            last_modified_ms: mtime,
            content_hash: None,
        };
        assert!(validator.is_input_valid(&fresh, now_ms(), false, &always_valid).valid);
        let moved = InputRecord::FileBased {
            filename: path,
            last_modified_ms: mtime - 1,
            content_hash: None,
        };
        assert!(!validator.is_input_valid(&moved, now_ms(), false, &always_valid).valid);
    }

    #[test]
    fn test_missing_file_is_invalid() {
        let dir = TempDir::new().expect("tempdir");
        let validator = FilesystemMetadataValidator::new(ValidatorOptions::default());
        let record = InputRecord::FileBased {
            filename: dir.path().join("gone.css"),
            last_modified_ms: 0,
            content_hash: None,
        };
        assert!(!validator.is_input_valid(&record, now_ms(), false, &always_valid).valid);
    }

    #[test]
    fn test_metadata_cache_avoids_rereads() {
        let dir = TempDir::new().expect("tempdir");
        let contents = b"body { color: red }";
        let path = write_file(&dir, "style.css", contents);
        let mtime = file_mtime_ms(&path).expect("file exists");
        let cache = metadata_cache();
        let validator = FilesystemMetadataValidator::with_metadata_cache(
            ValidatorOptions::default(),
            Arc::clone(&cache) as Arc<dyn Cache>,
        )
        .expect("cache is blocking");

        let record = InputRecord::FileBased {
            filename: path.clone(),
            last_modified_ms: mtime,
            content_hash: Some(content_hash(contents)),
        };
        // First check misses the metadata cache, hashes the file, and fills.
        assert!(validator.is_input_valid(&record, now_ms(), false, &always_valid).valid);
        assert_eq!(cache.counters().misses.get(), 1);
        assert_eq!(cache.counters().inserts.get(), 1);
        // Second check is answered from the metadata cache alone.
        assert!(validator.is_input_valid(&record, now_ms(), false, &always_valid).valid);
        assert_eq!(cache.counters().hits.get(), 1);
        assert_eq!(cache.counters().inserts.get(), 1);
    }

    #[test]
    fn test_touched_file_recomputes_hash() {
        let dir = TempDir::new().expect("tempdir");
        let contents = b"body { color: red }";
        let path = write_file(&dir, "style.css", contents);
        let mtime = file_mtime_ms(&path).expect("file exists");
        let cache = metadata_cache();
        let validator = FilesystemMetadataValidator::with_metadata_cache(
            ValidatorOptions::default(),
            Arc::clone(&cache) as Arc<dyn Cache>,
        )
        .expect("cache is blocking");
        let record = InputRecord::FileBased {
            filename: path.clone(),
            last_modified_ms: mtime,
            content_hash: Some(content_hash(contents)),
        };
        assert!(validator.is_input_valid(&record, now_ms(), false, &always_valid).valid);

        // Rewrite with different contents; wait so the mtime moves.
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_file(&dir, "style.css", b"body { color: blue }");
        let outcome = validator.is_input_valid(&record, now_ms(), false, &always_valid);
        assert!(!outcome.valid);
        // The refreshed entry was written back.
        assert_eq!(cache.counters().inserts.get(), 2);
    }

    #[test]
    fn test_key_is_host_specific() {
        let validator = FilesystemMetadataValidator::new(ValidatorOptions {
            hostname: "web7.example.com".to_string(),
            staleness_threshold_ms: 0,
        });
        assert_eq!(
            validator.metadata_key(Path::new("/var/www/style.css")),
            "file://web7.example.com/var/www/style.css"
        );
    }

    #[test]
    fn test_rejects_non_blocking_cache() {
        let cache: Arc<dyn Cache> = Arc::new(crate::test_support::DelayCache::new());
        let result =
            FilesystemMetadataValidator::with_metadata_cache(ValidatorOptions::default(), cache);
        assert!(matches!(result, Err(CacheError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_must_encode_backend_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let contents = b"body {}";
        let path = write_file(&dir, "style.css", contents);
        let mtime = file_mtime_ms(&path).expect("file exists");
        let shm: Arc<dyn Cache> = Arc::new(
            ShmCache::new(
                &dir.path().join("segment"),
                "metadata",
                &ShmCachePolicy::default(),
            )
            .expect("segment maps"),
        );
        let validator = FilesystemMetadataValidator::with_metadata_cache(
            ValidatorOptions::default(),
            Arc::clone(&shm),
        )
        .expect("shm cache is blocking");
        let record = InputRecord::FileBased {
            filename: path,
            last_modified_ms: mtime,
            content_hash: Some(content_hash(contents)),
        };
        assert!(validator.is_input_valid(&record, now_ms(), false, &always_valid).valid);
        // The entry is readable back through the key-in-value framing.
        assert!(validator.is_input_valid(&record, now_ms(), false, &always_valid).valid);
    }
}
