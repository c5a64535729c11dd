//! Key-in-value encoding for backends that cannot verify a retrieved blob
//! against the key it was stored under.
//!
//! The shared-memory backend stores only a hash of the key, so two distinct
//! keys can land in the same slot. Callers of such a backend serialize the
//! key alongside the value on put; on get the key is split back off and
//! compared against the requested key, converting hash collisions into
//! misses instead of wrong answers.
//!
//! Encoded layout: `value bytes || key bytes || key length as u32 LE`.
//! Decoding slices the shared buffer, so no payload copies are made.

use crate::value::SharedValue;
use bytes::Bytes;

const KEY_LEN_BYTES: usize = 4;

/// Append `key` to `value`, producing a fresh blob. The input value's shared
/// storage is left untouched.
pub fn encode_key_in_value(key: &str, value: &SharedValue) -> SharedValue {
    let key_bytes = key.as_bytes();
    let mut buffer = Vec::with_capacity(value.len() + key_bytes.len() + KEY_LEN_BYTES);
    buffer.extend_from_slice(value.as_bytes());
    buffer.extend_from_slice(key_bytes);
    buffer.extend_from_slice(&u32::try_from(key_bytes.len()).unwrap_or(u32::MAX).to_le_bytes());
    SharedValue::from(buffer)
}

/// Split an encoded blob back into its value, verifying that the embedded
/// key matches `expected_key`. Returns `None` on a malformed blob or a key
/// mismatch (a hash collision in the backend).
pub fn decode_value_matching_key(expected_key: &str, encoded: &SharedValue) -> Option<SharedValue> {
    let bytes: Bytes = encoded.clone().into_bytes();
    if bytes.len() < KEY_LEN_BYTES {
        return None;
    }
    let len_start = bytes.len() - KEY_LEN_BYTES;
    let mut len_buf = [0u8; KEY_LEN_BYTES];
    len_buf.copy_from_slice(&bytes[len_start..]);
    let key_len = u32::from_le_bytes(len_buf) as usize;
    if key_len > len_start {
        return None;
    }
    let key_start = len_start - key_len;
    if &bytes[key_start..len_start] != expected_key.as_bytes() {
        return None;
    }
    Some(SharedValue::from(bytes.slice(..key_start)))
}
