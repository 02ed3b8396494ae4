//! Content-defined chunking for large blobs.
//!
//! Blobs above [`CHUNK_THRESHOLD`] are split at boundaries chosen by a gear
//! rolling hash, so an insertion or deletion only shifts the chunks around the
//! edit instead of re-aligning the whole file. A manifest records the ordered
//! `(offset, length, digest)` triples; identical chunks across files share one
//! blob in the CAS, and transfers only move chunks the peer lacks.

use buildflow_core::{Digest, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Blobs at or above this size are chunked. 1 MiB.
pub const CHUNK_THRESHOLD: u64 = 1024 * 1024;

/// Chunk size bounds: boundaries are never accepted before `MIN_CHUNK`, and a
/// chunk is force-cut at `MAX_CHUNK`. The mask targets ~64 KiB on average, so
/// a localized edit in a multi-megabyte blob dirties only a few of many
/// chunks.
const MIN_CHUNK: usize = 32 * 1024;
const MAX_CHUNK: usize = 1024 * 1024;
const BOUNDARY_MASK: u64 = (1 << 16) - 1;

/// One chunk of a large blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub offset: u64,
    pub length: u32,
    pub digest: Digest,
}

/// Ordered chunk list describing one blob's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    /// Digest of the whole (reassembled) content.
    pub blob_digest: Digest,
    pub total_len: u64,
    pub chunks: Vec<ChunkRef>,
}

impl ChunkManifest {
    /// Slice `data` according to a chunk entry.
    pub fn slice<'a>(&self, data: &'a [u8], chunk: &ChunkRef) -> &'a [u8] {
        let start = chunk.offset as usize;
        &data[start..start + chunk.length as usize]
    }
}

/// The gear table: 256 pseudo-random 64-bit values, one per byte value.
/// Generated once from a fixed seed so boundaries are stable across runs,
/// builds, and machines.
fn gear_table() -> &'static [u64; 256] {
    static TABLE: OnceLock<[u64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        // splitmix64 with a fixed seed.
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut table = [0u64; 256];
        for slot in &mut table {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            *slot = z ^ (z >> 31);
        }
        table
    })
}

/// Split content into content-defined chunks.
///
/// Always returns at least one chunk for non-empty input; callers decide
/// whether the blob is worth chunking by comparing against
/// [`CHUNK_THRESHOLD`].
pub fn chunk(data: &[u8]) -> ChunkManifest {
    let table = gear_table();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < data.len() {
        let remaining = data.len() - start;
        let end = if remaining <= MIN_CHUNK {
            data.len()
        } else {
            let limit = remaining.min(MAX_CHUNK);
            let mut hash: u64 = 0;
            let mut cut = limit;
            for i in MIN_CHUNK..limit {
                hash = (hash << 1).wrapping_add(table[data[start + i] as usize]);
                if hash & BOUNDARY_MASK == 0 {
                    cut = i + 1;
                    break;
                }
            }
            start + cut
        };

        let piece = &data[start..end];
        chunks.push(ChunkRef {
            offset: start as u64,
            length: piece.len() as u32,
            digest: Digest::of_bytes(piece),
        });
        start = end;
    }

    ChunkManifest {
        blob_digest: Digest::of_bytes(data),
        total_len: data.len() as u64,
        chunks,
    }
}

/// Rebuild content from a manifest, fetching each chunk by digest.
///
/// Every fetched chunk is verified against its digest, and the reassembled
/// whole against the manifest's blob digest; any mismatch is an integrity
/// error.
pub fn reassemble(
    manifest: &ChunkManifest,
    mut fetch: impl FnMut(&Digest) -> Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(manifest.total_len as usize);
    for chunk in &manifest.chunks {
        let data = fetch(&chunk.digest)?;
        if !chunk.digest.verify(&data) {
            return Err(Error::DigestMismatch {
                expected: chunk.digest,
                actual: Digest::of_bytes(&data),
            });
        }
        if data.len() != chunk.length as usize {
            return Err(Error::CacheCorrupted(format!(
                "chunk {} has length {}, manifest says {}",
                chunk.digest,
                data.len(),
                chunk.length
            )));
        }
        out.extend_from_slice(&data);
    }
    if !manifest.blob_digest.verify(&out) {
        return Err(Error::DigestMismatch {
            expected: manifest.blob_digest,
            actual: Digest::of_bytes(&out),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Deterministic pseudo-random buffer; xorshift so tests stay seed-stable.
    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn fetch_map(manifest: &ChunkManifest, data: &[u8]) -> HashMap<Digest, Vec<u8>> {
        manifest
            .chunks
            .iter()
            .map(|c| (c.digest, manifest.slice(data, c).to_vec()))
            .collect()
    }

    #[test]
    fn test_chunks_cover_input_contiguously() {
        let data = pseudo_random(10 * 1024 * 1024, 42);
        let manifest = chunk(&data);

        let mut expected_offset = 0u64;
        for c in &manifest.chunks {
            assert_eq!(c.offset, expected_offset);
            assert!(c.length as usize <= MAX_CHUNK);
            expected_offset += c.length as u64;
        }
        assert_eq!(expected_offset, data.len() as u64);
        // ~64 KiB average: a 10 MiB buffer yields on the order of a hundred.
        assert!(manifest.chunks.len() >= 20);
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let data = pseudo_random(3 * 1024 * 1024, 7);
        assert_eq!(chunk(&data), chunk(&data));
    }

    #[test]
    fn test_small_edit_preserves_most_chunks() {
        let mut data = pseudo_random(10 * 1024 * 1024, 99);
        let before = chunk(&data);

        // Modify 4 KiB in the middle.
        let mid = data.len() / 2;
        for byte in &mut data[mid..mid + 4096] {
            *byte ^= 0xA5;
        }
        let after = chunk(&data);

        let before_set: std::collections::HashSet<Digest> =
            before.chunks.iter().map(|c| c.digest).collect();
        let reused = after
            .chunks
            .iter()
            .filter(|c| before_set.contains(&c.digest))
            .count();
        let reuse_ratio = reused as f64 / after.chunks.len() as f64;
        assert!(
            reuse_ratio >= 0.95,
            "only {reused}/{} chunks reused",
            after.chunks.len()
        );
    }

    #[test]
    fn test_reassemble_round_trip() {
        let data = pseudo_random(2 * 1024 * 1024 + 317, 5);
        let manifest = chunk(&data);
        let store = fetch_map(&manifest, &data);

        let rebuilt = reassemble(&manifest, |d| Ok(store[d].clone())).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_reassemble_detects_corrupt_chunk() {
        let data = pseudo_random(2 * 1024 * 1024, 11);
        let manifest = chunk(&data);
        let store = fetch_map(&manifest, &data);

        let err = reassemble(&manifest, |d| {
            let mut bytes = store[d].clone();
            bytes[0] ^= 0xFF;
            Ok(bytes)
        })
        .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[test]
    fn test_empty_input() {
        let manifest = chunk(&[]);
        assert!(manifest.chunks.is_empty());
        assert_eq!(manifest.total_len, 0);
        let rebuilt = reassemble(&manifest, |_| Ok(Vec::new())).unwrap();
        assert!(rebuilt.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_reassemble_inverts_chunk(len in 0usize..600_000, seed in 1u64..u64::MAX) {
            let data = pseudo_random(len, seed);
            let manifest = chunk(&data);
            let store = fetch_map(&manifest, &data);
            let rebuilt = reassemble(&manifest, |d| Ok(store[d].clone())).unwrap();
            prop_assert_eq!(rebuilt, data);
        }
    }
}
