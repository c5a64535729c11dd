//! Shared immutable value blobs for cache entries.
//!
//! A [`SharedValue`] is a reference-counted, immutable byte string. Cloning is
//! cheap (a refcount bump) so the same payload can be handed to many waiting
//! callbacks, cross worker threads, and sit in an in-process LRU at the same
//! time. Mutation always allocates a fresh buffer; adapters that need to
//! rewrite a value (for example to prepend the key before handing it to a
//! backend that cannot store keys) must build a new blob rather than touch
//! shared storage.

use bytes::Bytes;

/// Reference-counted immutable byte string used for all cache values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedValue(Bytes);

impl SharedValue {
    /// Create an empty value.
    pub fn new() -> Self {
        Self(Bytes::new())
    }

    /// Create a value by copying the given bytes into a fresh buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    /// Length of the value in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff the value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The value interpreted as UTF-8, with invalid sequences replaced.
    /// Intended for logging and tests.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// Consume the value, returning the shared buffer.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for SharedValue {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for SharedValue {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<String> for SharedValue {
    fn from(data: String) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<&str> for SharedValue {
    fn from(data: &str) -> Self {
        Self(Bytes::copy_from_slice(data.as_bytes()))
    }
}

impl AsRef<[u8]> for SharedValue {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
