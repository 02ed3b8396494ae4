//! Content-addressed hashing for inputs, outputs, and fingerprints.
//!
//! Every blob, input file, and action fingerprint is identified by its BLAKE3
//! content digest. This provides:
//! - Deduplication: same content = same digest = stored once
//! - Verification: download and verify the digest matches
//! - Immutability: content at a digest never changes

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 content digest.
///
/// Used to uniquely identify blob content and action fingerprints.
/// Format: `blake3:<64 hex characters>`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the digest of a byte slice.
    ///
    /// # Example
    /// ```
    /// use buildflow_core::Digest;
    ///
    /// let digest = Digest::of_bytes(b"hello world");
    /// assert!(digest.to_string().starts_with("blake3:"));
    /// ```
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Compute a keyed digest (MAC) of a byte slice.
    ///
    /// Used to sign cache entries with the workspace-bound secret.
    pub fn keyed(key: &[u8; 32], data: &[u8]) -> Self {
        Self(*blake3::keyed_hash(key, data).as_bytes())
    }

    /// Wrap raw digest bytes.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a hex string (with or without the `blake3:` prefix).
    pub fn from_hex(s: &str) -> Result<Self> {
        let hex_str = s.strip_prefix("blake3:").unwrap_or(s);

        if hex_str.len() != 64 {
            return Err(Error::InvalidDigest(format!(
                "expected 64 hex characters, got {}",
                hex_str.len()
            )));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::InvalidDigest(format!("invalid hex: {e}")))?;

        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::InvalidDigest(format!("digest must be exactly 32 bytes, got {}", v.len()))
        })?;

        Ok(Self(array))
    }

    /// Get the raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Get the hex-encoded digest without prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify that data matches this digest.
    ///
    /// # Example
    /// ```
    /// use buildflow_core::Digest;
    ///
    /// let digest = Digest::of_bytes(b"hello world");
    /// assert!(digest.verify(b"hello world"));
    /// assert!(!digest.verify(b"different data"));
    /// ```
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of_bytes(data) == *self
    }
}

/// Incremental digest computation over streamed content.
///
/// Thin wrapper over the BLAKE3 hasher so callers never touch the hash crate
/// directly.
#[derive(Default)]
pub struct DigestHasher(blake3::Hasher);

impl DigestHasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finalize(&self) -> Digest {
        Digest(*self.0.finalize().as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blake3:{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hex is noise in debug dumps; eight chars is enough to correlate.
        write!(f, "Digest({}..)", &self.to_hex()[..8])
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}
