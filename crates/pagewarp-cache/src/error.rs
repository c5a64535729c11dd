//! Error types for cache construction and the purge subsystem.
//!
//! Cache operations themselves never return errors: every failure path in
//! Get/Put/Delete surfaces to callers as a not-found plus a counter bump
//! (see the statistics surface in [`crate::stats`]). The error type here
//! covers what *can* fail synchronously: constructing backends from
//! configuration, and the internal file-system plumbing of the purge and
//! file-cache code.

use thiserror::Error;

/// Errors that can occur constructing caches or operating their
/// file-system plumbing.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Invalid cache configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// A backend with the same name was already registered
    #[error("Duplicate cache name: {0}")]
    DuplicateName(String),

    /// Shared-memory segment too small to hold even one sector
    #[error("Shared-memory cache too small: {requested} bytes, minimum {minimum}")]
    SegmentTooSmall {
        /// Requested segment size in bytes
        requested: usize,
        /// Smallest usable segment size in bytes
        minimum: usize,
    },

    /// Shared-memory segment header did not match the expected layout
    #[error("Shared-memory segment corrupt: {0}")]
    SegmentCorrupt(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// IO error during cache operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Named-lock acquisition timed out
    #[error("Lock timeout: {0}")]
    LockTimeout(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

/// Result type for cache construction and file-system plumbing.
pub type CacheResult<T> = Result<T, CacheError>;
