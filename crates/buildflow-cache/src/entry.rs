//! Cache entries and their integrity signatures.
//!
//! An entry records everything needed to replay an action without executing
//! it: the fingerprint, the metadata hash, per-input validation stamps, the
//! produced outputs with their content digests, and the captured output
//! streams. Entries are signed with a keyed BLAKE3 MAC under the
//! workspace-bound secret; an entry whose MAC does not verify is treated as
//! absent and reported as corruption.

use buildflow_core::{codec, Digest, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Cheap per-input validation stamp.
///
/// Size and mtime form the first validation tier; if both are unchanged the
/// content is presumed unchanged. Any mismatch forces a content-hash
/// recomputation, which is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputStamp {
    pub digest: Digest,
    pub size: u64,
    pub mtime_ms: u64,
}

/// One memoized action result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The action fingerprint this entry answers for.
    pub fingerprint: Digest,
    /// Canonical hash of the opaque metadata map supplied at store time.
    pub metadata_hash: Digest,
    /// Declared inputs with their stamps at store time, keyed by path.
    pub inputs: BTreeMap<String, InputStamp>,
    /// Declared output path -> content digest.
    pub outputs: BTreeMap<PathBuf, Digest>,
    /// Every blob digest this entry references (whole outputs and, for
    /// chunked outputs, the individual chunks). The eviction sweep keeps a
    /// blob alive while any surviving entry lists it here.
    pub blobs: Vec<Digest>,
    /// Output digests whose content is described by a chunk manifest rather
    /// than a single blob.
    pub chunked: BTreeSet<Digest>,
    /// Captured streams, replayed on cache hits.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Total bytes of output content, for eviction accounting.
    pub output_bytes: u64,
    pub created_at_ms: u64,
    /// Updated on every hit; drives LRU eviction. Excluded from the MAC so
    /// touching an entry does not require re-signing it.
    pub last_access_ms: u64,
}

impl CacheEntry {
    /// The bytes covered by the integrity MAC: everything except
    /// `last_access_ms`.
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(&(
            &self.fingerprint,
            &self.metadata_hash,
            &self.inputs,
            &self.outputs,
            &self.blobs,
            &self.chunked,
            &self.stdout,
            &self.stderr,
            self.output_bytes,
            self.created_at_ms,
        ))
    }

    /// Sign this entry under the workspace secret.
    pub fn sign(self, secret: &[u8; 32]) -> Result<SignedEntry> {
        let mac = Digest::keyed(secret, &self.canonical_bytes()?);
        Ok(SignedEntry { entry: self, mac })
    }
}

/// A cache entry plus its keyed MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub entry: CacheEntry,
    pub mac: Digest,
}

impl SignedEntry {
    /// Verify the MAC, returning the entry on success.
    ///
    /// A mismatch means corruption or a foreign workspace secret; either way
    /// the entry must not be trusted.
    pub fn verify(self, secret: &[u8; 32]) -> Result<CacheEntry> {
        let expected = Digest::keyed(secret, &self.entry.canonical_bytes()?);
        if expected != self.mac {
            return Err(Error::CacheCorrupted(format!(
                "entry {} failed MAC verification",
                self.entry.fingerprint
            )));
        }
        Ok(self.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CacheEntry {
        let mut outputs = BTreeMap::new();
        outputs.insert(PathBuf::from("out/lib.a"), Digest::of_bytes(b"lib"));
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "src/lib.rs".to_string(),
            InputStamp {
                digest: Digest::of_bytes(b"source"),
                size: 6,
                mtime_ms: 1_700_000_000_000,
            },
        );
        CacheEntry {
            fingerprint: Digest::of_bytes(b"fp"),
            metadata_hash: Digest::of_bytes(b"meta"),
            inputs,
            outputs,
            blobs: vec![Digest::of_bytes(b"lib")],
            chunked: BTreeSet::new(),
            stdout: b"compiled".to_vec(),
            stderr: Vec::new(),
            output_bytes: 3,
            created_at_ms: 1_700_000_000_000,
            last_access_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let secret = [7u8; 32];
        let entry = sample_entry();
        let signed = entry.clone().sign(&secret).unwrap();
        let recovered = signed.verify(&secret).unwrap();
        assert_eq!(entry, recovered);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signed = sample_entry().sign(&[7u8; 32]).unwrap();
        let err = signed.verify(&[8u8; 32]).unwrap_err();
        assert!(matches!(err, Error::CacheCorrupted(_)));
    }

    #[test]
    fn test_tampered_entry_rejected() {
        let secret = [7u8; 32];
        let mut signed = sample_entry().sign(&secret).unwrap();
        signed.entry.stdout = b"forged".to_vec();
        assert!(signed.verify(&secret).is_err());
    }

    #[test]
    fn test_last_access_not_covered_by_mac() {
        let secret = [7u8; 32];
        let mut signed = sample_entry().sign(&secret).unwrap();
        signed.entry.last_access_ms += 12345;
        assert!(signed.verify(&secret).is_ok());
    }

    #[test]
    fn test_bincode_round_trip() {
        let signed = sample_entry().sign(&[1u8; 32]).unwrap();
        let bytes = bincode::serialize(&signed).unwrap();
        let decoded: SignedEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(signed, decoded);
    }
}
