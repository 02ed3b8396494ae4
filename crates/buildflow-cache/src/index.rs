//! The on-disk entry catalog.
//!
//! `index.bin` is an append-structured log: a fixed header (`BLDC` magic, one
//! version byte, a big-endian entry count) followed by length-prefixed signed
//! entries. The loader is tolerant by design: a torn tail yields the entries
//! written before the tear, and entries failing MAC verification are skipped
//! and reported, never trusted.

use crate::entry::{CacheEntry, SignedEntry};
use buildflow_core::{codec, Digest, Result};
use std::collections::HashMap;
use std::path::Path;

/// Magic identifying a buildflow cache index.
pub const INDEX_MAGIC: &[u8; 4] = b"BLDC";
/// Current index format version.
pub const INDEX_VERSION: u8 = 1;

const HEADER_SIZE: usize = 4 + 1 + 8;

/// In-memory catalog of cache entries, keyed by fingerprint.
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<Digest, CacheEntry>,
    /// Entries dropped during the last load because their MAC or framing was
    /// invalid.
    corrupted: u64,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries skipped during load due to corruption.
    pub fn corrupted(&self) -> u64 {
        self.corrupted
    }

    pub fn get(&self, fingerprint: &Digest) -> Option<&CacheEntry> {
        self.entries.get(fingerprint)
    }

    pub fn get_mut(&mut self, fingerprint: &Digest) -> Option<&mut CacheEntry> {
        self.entries.get_mut(fingerprint)
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.fingerprint, entry);
    }

    pub fn remove(&mut self, fingerprint: &Digest) -> Option<CacheEntry> {
        self.entries.remove(fingerprint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Total output bytes across all entries, for the eviction bound.
    pub fn total_output_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.output_bytes).sum()
    }

    /// Parse an index file image. Entries that fail framing or MAC
    /// verification are counted and skipped; a truncated tail ends the scan.
    pub fn decode(data: &[u8], secret: &[u8; 32]) -> Result<Self> {
        let mut index = Self::new();

        if data.is_empty() {
            return Ok(index);
        }
        if data.len() < HEADER_SIZE || &data[0..4] != INDEX_MAGIC {
            return Err(buildflow_core::Error::CacheCorrupted(
                "index header missing or wrong magic".into(),
            ));
        }
        let version = data[4];
        if version > INDEX_VERSION {
            return Err(buildflow_core::Error::CacheCorrupted(format!(
                "unsupported index version {version} (supported up to {INDEX_VERSION})"
            )));
        }
        let declared = u64::from_be_bytes(
            data[5..13]
                .try_into()
                .map_err(|_| buildflow_core::Error::CacheCorrupted("short header".into()))?,
        );

        let mut offset = HEADER_SIZE;
        let mut read = 0u64;
        while read < declared && offset + 4 <= data.len() {
            let len = u32::from_be_bytes(
                data[offset..offset + 4]
                    .try_into()
                    .map_err(|_| buildflow_core::Error::CacheCorrupted("short frame".into()))?,
            ) as usize;
            offset += 4;
            if offset + len > data.len() {
                // Torn tail: keep what we have.
                tracing::warn!(read, declared, "index truncated mid-entry; keeping prefix");
                index.corrupted += declared - read;
                break;
            }
            match codec::decode::<SignedEntry>(&data[offset..offset + len])
                .and_then(|signed| signed.verify(secret))
            {
                Ok(entry) => index.insert(entry),
                Err(err) => {
                    tracing::warn!(%err, "skipping corrupted index entry");
                    index.corrupted += 1;
                }
            }
            offset += len;
            read += 1;
        }

        Ok(index)
    }

    /// Serialize the catalog, signing every entry.
    pub fn encode(&self, secret: &[u8; 32]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(INDEX_MAGIC);
        out.push(INDEX_VERSION);
        out.extend_from_slice(&(self.entries.len() as u64).to_be_bytes());

        // Stable order keeps the file byte-identical for identical contents.
        let mut fingerprints: Vec<&Digest> = self.entries.keys().collect();
        fingerprints.sort();
        for fp in fingerprints {
            let entry = &self.entries[fp];
            let signed = entry.clone().sign(secret)?;
            let frame = codec::encode(&signed)?;
            out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            out.extend_from_slice(&frame);
        }
        Ok(out)
    }

    /// Load an index file; a missing file is an empty index.
    pub fn load(path: &Path, secret: &[u8; 32]) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Self::decode(&data, secret),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }
}
