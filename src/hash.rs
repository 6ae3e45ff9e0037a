//! Content-hash normalization and storage-key mapping.
//!
//! Objects are addressed by the MD5 digest of their bytes, written as 32
//! lowercase hex characters.  [`ContentHash::normalize`] never fails: any
//! input collapses to its lowercase hex characters, so a malformed hash
//! simply becomes a short (possibly empty) degenerate hash that will not be
//! found in the store.
//!
//! [`HashCodec`] owns the key prefix and is the only place storage keys are
//! built.

use std::fmt;

use base64::Engine;

/// Default prefix under which every object key lives.
pub const OBJECT_KEY_PREFIX: &str = "objects";

/// Length in hex characters of a well-formed digest (128-bit MD5).
pub const DIGEST_HEX_LEN: usize = 32;

/// A normalized content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Lowercase `raw`, then drop every character outside `0-9a-f`.
    pub fn normalize(raw: &str) -> Self {
        let hash = raw
            .chars()
            .flat_map(char::to_lowercase)
            .filter(|ch| matches!(ch, '0'..='9' | 'a'..='f'))
            .collect();
        Self(hash)
    }

    /// Build a hash from a raw 16-byte digest.
    pub fn from_digest(digest: &[u8; 16]) -> Self {
        Self(hex::encode(digest))
    }

    /// The normalized hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the hash has exactly the digest length.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == DIGEST_HEX_LEN
    }

    /// Decode the hash into the raw digest, if well formed.
    pub fn digest(&self) -> Option<[u8; 16]> {
        if !self.is_well_formed() {
            return None;
        }
        let mut out = [0u8; 16];
        hex::decode_to_slice(&self.0, &mut out).ok()?;
        Some(out)
    }

    /// Base64 form of the digest, as used in `Content-MD5` headers.
    pub fn to_base64(&self) -> Option<String> {
        self.digest().map(|d| md5_base64(&d))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base64-encode a raw MD5 digest.
pub fn md5_base64(digest: &[u8; 16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Compute the MD5 digest of `data`.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Maps content hashes to storage keys and back.
#[derive(Debug, Clone)]
pub struct HashCodec {
    prefix: String,
}

impl Default for HashCodec {
    fn default() -> Self {
        Self::new(OBJECT_KEY_PREFIX)
    }
}

impl HashCodec {
    /// Create a codec for keys under `prefix` (no trailing slash).
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The listing prefix, including the separator.
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// `"<prefix>/<hash>"`.
    pub fn to_key(&self, hash: &ContentHash) -> String {
        format!("{}/{}", self.prefix, hash.as_str())
    }

    /// Inverse of [`to_key`](Self::to_key): slice the prefix off.
    pub fn to_hash(&self, key: &str) -> ContentHash {
        let start = self.prefix.len() + 1;
        ContentHash(key.get(start..).unwrap_or_default().to_string())
    }
}
