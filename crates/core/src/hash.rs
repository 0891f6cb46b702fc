//! Chunk digest type and hex utilities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Digest of the empty file, used for nested-catalog marker entries.
pub const EMPTY_FILE_DIGEST: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

/// A pre-computed SHA-1 chunk digest represented as 20 bytes.
///
/// Graft databases carry these as 40-character lowercase hex strings; the
/// publisher never computes chunk digests itself, it only validates and
/// forwards them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkDigest([u8; 20]);

impl ChunkDigest {
    /// Create a new ChunkDigest from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse from a 40-character lowercase hex string.
    ///
    /// Uppercase digits are rejected: graft producers are required to emit
    /// lowercase and the cache directory layout depends on it.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 40 {
            return Err(crate::Error::InvalidDigest(format!(
                "expected 40 hex chars, got {}",
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(crate::Error::InvalidDigest(format!(
                "not a lowercase hex digest: {s}"
            )));
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Cache-directory relative path for this digest: `xx/yyyy…`.
    pub fn to_cache_path(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}", &hex[..2], &hex[2..])
    }
}

impl fmt::Debug for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Check that a string is non-empty, even-length lowercase hex.
///
/// Manifest hashes are carried as opaque hex and may use a different digest
/// width than chunk digests.
pub fn is_hex_digest(s: &str) -> bool {
    !s.is_empty()
        && s.len() % 2 == 0
        && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
