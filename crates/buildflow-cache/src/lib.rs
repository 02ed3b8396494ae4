//! Content-addressed action cache.
//!
//! Memoizes `Action -> ActionResult` with integrity-verified storage:
//! - a local on-disk tier (signed index + sharded blob store),
//! - an optional remote tier reached over HTTP with chunk-level dedup,
//! - a per-fingerprint in-flight registry guaranteeing at-most-one concurrent
//!   execution per fingerprint.
//!
//! On-disk layout:
//! ```text
//! <root>/
//!   index.bin        # signed catalog: fingerprint -> entry
//!   blobs/aa/bb/...  # content-addressed blobs, sharded by first 4 hex chars
//!   manifests/       # chunk manifests for large blobs
//!   tmp/<uuid>/      # in-progress writes; renamed on commit
//! ```
//!
//! Failure semantics: read failures degrade to misses, write failures lose
//! only future hits, integrity failures are surfaced and the entry is
//! invalidated - never silently recovered.

pub mod chunk;
pub mod entry;
pub mod env_vars;
pub mod index;
pub mod inflight;
pub mod remote;
pub mod store;

pub use chunk::{chunk, reassemble, ChunkManifest, ChunkRef, CHUNK_THRESHOLD};
pub use entry::{CacheEntry, InputStamp, SignedEntry};
pub use index::CacheIndex;
pub use inflight::{InflightClaim, InflightRegistry};
pub use remote::{RemoteCache, RemoteCacheConfig, TransferStats};
pub use store::{CacheLimits, CacheStats, EvictOutcome, LocalCache};
