//! Local on-disk cache tier.
//!
//! Owns the cache directory: the signed index, the sharded blob store, chunk
//! manifests, and the staging area for atomic writes. Lookups validate
//! declared inputs in two tiers (size+mtime first, content hash when the
//! stamp disagrees) and restore outputs from the CAS; stores write blobs and
//! the index atomically via temp-file + rename so concurrent readers never
//! observe a torn entry. Eviction runs under a coarse cross-process file lock
//! and removes orphaned blobs only after a reference sweep.

use crate::chunk::{self, ChunkManifest, CHUNK_THRESHOLD};
use crate::entry::{CacheEntry, InputStamp};
use crate::env_vars;
use crate::index::CacheIndex;
use crate::inflight::InflightRegistry;
use buildflow_core::{
    action, codec, Action, ActionResult, ActionStatus, Digest, Error, ExecutionMetadata,
    ResourceUsage, Result,
};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Magic for chunk manifest files.
const MANIFEST_MAGIC: &[u8; 4] = b"BLDM";
const MANIFEST_VERSION: u32 = 1;

/// Eviction bounds for the local tier.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_bytes: u64,
    pub max_entries: usize,
    pub max_age: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024 * 1024,
            max_entries: 100_000,
            max_age: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl CacheLimits {
    /// Read bounds from the `BUILDER_ACTION_CACHE_*` environment variables.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_bytes: env_vars::env_u64_or_default(
                env_vars::ACTION_CACHE_MAX_SIZE,
                default.max_bytes,
            ),
            max_entries: env_vars::env_usize_or_default(
                env_vars::ACTION_CACHE_MAX_ENTRIES,
                default.max_entries,
            ),
            max_age: Duration::from_secs(
                env_vars::env_u64_or_default(
                    env_vars::ACTION_CACHE_MAX_AGE_DAYS,
                    default.max_age.as_secs() / (24 * 3600),
                ) * 24
                    * 3600,
            ),
        }
    }
}

/// Counters for monitoring; cheap enough to keep always-on.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evicted_entries: AtomicU64,
    integrity_events: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
    pub fn evicted_entries(&self) -> u64 {
        self.evicted_entries.load(Ordering::Relaxed)
    }
    pub fn integrity_events(&self) -> u64 {
        self.integrity_events.load(Ordering::Relaxed)
    }

    /// Hit rate in [0.0, 1.0].
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

/// Result of one eviction pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictOutcome {
    pub removed_entries: u64,
    pub removed_blobs: u64,
    pub remaining_bytes: u64,
}

/// The local cache: signed index + content-addressed blob store, optionally
/// backed by a remote tier consulted on local misses and fed on stores.
pub struct LocalCache {
    root: PathBuf,
    secret: [u8; 32],
    limits: CacheLimits,
    index: RwLock<CacheIndex>,
    stats: CacheStats,
    inflight: InflightRegistry,
    remote: Option<crate::remote::RemoteCache>,
}

impl LocalCache {
    /// Open (or initialize) a cache directory.
    ///
    /// A structurally corrupt index is reported and rebuilt empty; the blobs
    /// it referenced are reclaimed by the next eviction sweep.
    pub async fn open(
        root: impl Into<PathBuf>,
        secret: [u8; 32],
        limits: CacheLimits,
    ) -> Result<Self> {
        let root = root.into();
        for sub in ["blobs", "manifests", "tmp"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }

        let index_path = root.join("index.bin");
        let index = match CacheIndex::load(&index_path, &secret) {
            Ok(index) => {
                if index.corrupted() > 0 {
                    tracing::warn!(
                        skipped = index.corrupted(),
                        "cache index contained corrupted entries"
                    );
                }
                index
            }
            Err(err) => {
                tracing::warn!(%err, "cache index unreadable; starting empty");
                CacheIndex::new()
            }
        };

        Ok(Self {
            root,
            secret,
            limits,
            index: RwLock::new(index),
            stats: CacheStats::default(),
            inflight: InflightRegistry::new(),
            remote: None,
        })
    }

    /// Attach a remote tier, consulted on local misses and fed best-effort
    /// on stores.
    pub fn with_remote(mut self, remote: crate::remote::RemoteCache) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The per-fingerprint in-flight registry guarding duplicate execution.
    pub fn inflight(&self) -> &InflightRegistry {
        &self.inflight
    }

    pub async fn entry_count(&self) -> usize {
        self.index.read().await.len()
    }

    /// Whether the in-memory view of the index exceeds any eviction bound.
    pub async fn over_limits(&self) -> bool {
        let index = self.index.read().await;
        index.len() > self.limits.max_entries
            || index.total_output_bytes() > self.limits.max_bytes
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.bin")
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root
            .join("blobs")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex)
    }

    fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("manifests")
            .join(format!("{}.bin", digest.to_hex()))
    }

    /// Atomic write: stage under tmp/<uuid>, fsync, rename into place.
    async fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    /// Atomic write for files outside the cache root (workspace restores):
    /// stages beside the destination so the rename never crosses a
    /// filesystem boundary.
    async fn restore_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("restore");
        let staging = path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    async fn write_blob(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        self.atomic_write(&path, data).await
    }

    /// Read and verify one blob.
    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let data = tokio::fs::read(self.blob_path(digest)).await?;
        if !digest.verify(&data) {
            return Err(Error::DigestMismatch {
                expected: *digest,
                actual: Digest::of_bytes(&data),
            });
        }
        Ok(data)
    }

    async fn read_manifest(&self, digest: &Digest) -> Result<ChunkManifest> {
        let data = tokio::fs::read(self.manifest_path(digest)).await?;
        let payload = codec::unwrap(MANIFEST_MAGIC, MANIFEST_VERSION, &data)?;
        codec::decode(payload)
    }

    /// Read one output's content, reassembling from chunks when needed.
    async fn read_output(&self, digest: &Digest, chunked: bool) -> Result<Vec<u8>> {
        if !chunked {
            return self.read_blob(digest).await;
        }
        let manifest = self.read_manifest(digest).await?;
        let mut out = Vec::with_capacity(manifest.total_len as usize);
        for chunk_ref in &manifest.chunks {
            let piece = self.read_blob(&chunk_ref.digest).await?;
            out.extend_from_slice(&piece);
        }
        if !digest.verify(&out) {
            return Err(Error::DigestMismatch {
                expected: *digest,
                actual: Digest::of_bytes(&out),
            });
        }
        Ok(out)
    }

    /// Look up a memoized result for `action`.
    ///
    /// Returns a hit iff the entry exists, the metadata hash matches, and
    /// every declared input still matches its stored stamp (content hash
    /// authoritative). On a hit the declared outputs are restored to their
    /// paths and a replayed `ActionResult` is returned. Read failures degrade
    /// to misses; integrity failures invalidate the entry and are reported.
    pub async fn lookup(
        &self,
        action: &Action,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Option<ActionResult>> {
        let fingerprint = action.fingerprint();

        let entry = match self.index.read().await.get(&fingerprint) {
            Some(entry) => entry.clone(),
            None => {
                if let Some(result) = self.remote_lookup(&fingerprint, metadata).await {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(result));
                }
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if action::metadata_hash(metadata) != entry.metadata_hash {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        if !self.inputs_still_valid(&entry).await {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        // Restore outputs. A missing blob is a recoverable miss; corrupt
        // content invalidates the entry outright.
        let mut outputs = BTreeMap::new();
        for (path, digest) in &entry.outputs {
            let chunked = entry.chunked.contains(digest);
            let data = match self.read_output(digest, chunked).await {
                Ok(data) => data,
                Err(Error::Io(e)) => {
                    tracing::warn!(%digest, error = %e, "cache blob unreadable; treating as miss");
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Err(err) => {
                    self.invalidate(&fingerprint, &err).await;
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            };
            self.restore_file(path, &data).await?;
            outputs.insert(path.clone(), *digest);
        }

        // Touch for LRU.
        {
            let mut index = self.index.write().await;
            if let Some(live) = index.get_mut(&fingerprint) {
                live.last_access_ms = now_ms();
            }
        }

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%fingerprint, "action cache hit");

        Ok(Some(ActionResult {
            status: ActionStatus::Success,
            exit_code: 0,
            stdout: entry.stdout.clone(),
            stderr: entry.stderr.clone(),
            outputs,
            usage: ResourceUsage::default(),
            metadata: ExecutionMetadata {
                worker_id: String::new(),
                cached_from: Some("local".to_string()),
            },
        }))
    }

    /// Consult the remote tier for a fingerprint the local index lacks.
    ///
    /// Every failure degrades to a miss: transient ones with a warning,
    /// integrity ones with a structured error event. A usable remote entry is
    /// adopted into the local tier (blobs, manifests, index) so the next hit
    /// is local.
    async fn remote_lookup(
        &self,
        fingerprint: &Digest,
        metadata: &BTreeMap<String, String>,
    ) -> Option<ActionResult> {
        let remote = self.remote.as_ref()?;
        match self.remote_lookup_inner(remote, fingerprint, metadata).await {
            Ok(result) => result,
            Err(err) => {
                match err.class() {
                    buildflow_core::ErrorClass::Integrity => {
                        self.stats.integrity_events.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(%fingerprint, error = %err, "remote cache integrity failure");
                    }
                    _ => {
                        tracing::warn!(%fingerprint, error = %err, "remote cache lookup failed; treating as miss");
                    }
                }
                None
            }
        }
    }

    async fn remote_lookup_inner(
        &self,
        remote: &crate::remote::RemoteCache,
        fingerprint: &Digest,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Option<ActionResult>> {
        let signed = match remote.get_entry(fingerprint).await? {
            Some(signed) => signed,
            None => return Ok(None),
        };

        // Cross-workspace policy: with require_same_secret the foreign MAC
        // must verify under our secret; otherwise the entry fields are taken
        // on faith and every blob is digest-verified below.
        let entry = if remote.config().require_same_secret {
            signed.verify(&self.secret)?
        } else {
            signed.entry
        };

        if action::metadata_hash(metadata) != entry.metadata_hash {
            return Ok(None);
        }
        if !self.inputs_still_valid(&entry).await {
            return Ok(None);
        }

        // Pull outputs, adopting the blobs into the local CAS as they arrive.
        let mut outputs = BTreeMap::new();
        for (path, digest) in &entry.outputs {
            let chunked = entry.chunked.contains(digest);
            let data = if chunked {
                remote.pull_chunked(digest).await?
            } else {
                remote.get_blob(digest).await?
            };
            let data = match data {
                Some(data) => data,
                None => {
                    tracing::warn!(%digest, "remote entry references missing blob");
                    return Ok(None);
                }
            };
            if chunked {
                let manifest = chunk::chunk(&data);
                for chunk_ref in &manifest.chunks {
                    self.write_blob(&chunk_ref.digest, manifest.slice(&data, chunk_ref))
                        .await?;
                }
                let framed =
                    codec::wrap(MANIFEST_MAGIC, MANIFEST_VERSION, &codec::encode(&manifest)?);
                self.atomic_write(&self.manifest_path(digest), &framed).await?;
            } else {
                self.write_blob(digest, &data).await?;
            }
            self.restore_file(path, &data).await?;
            outputs.insert(path.clone(), *digest);
        }

        // Adopt the entry locally; persisting re-signs it under our secret.
        let stdout = entry.stdout.clone();
        let stderr = entry.stderr.clone();
        let mut adopted = entry;
        adopted.last_access_ms = now_ms();
        {
            let mut index = self.index.write().await;
            index.insert(adopted);
            self.persist_index(&index).await?;
        }

        tracing::debug!(%fingerprint, "remote action cache hit");
        Ok(Some(ActionResult {
            status: ActionStatus::Success,
            exit_code: 0,
            stdout,
            stderr,
            outputs,
            usage: ResourceUsage::default(),
            metadata: ExecutionMetadata {
                worker_id: String::new(),
                cached_from: Some("remote".to_string()),
            },
        }))
    }

    /// Two-tier input validation: size+mtime first, content hash when the
    /// cheap stamp disagrees.
    async fn inputs_still_valid(&self, entry: &CacheEntry) -> bool {
        for (path, stamp) in &entry.inputs {
            let current = match stamp_file(Path::new(path)).await {
                Ok(current) => current,
                Err(_) => return false,
            };
            if current.size == stamp.size && current.mtime_ms == stamp.mtime_ms {
                continue;
            }
            // Cheap tier disagreed; the content hash is authoritative.
            match hash_file(Path::new(path)).await {
                Ok(digest) if digest == stamp.digest => continue,
                _ => return false,
            }
        }
        true
    }

    /// Remove an entry after an integrity failure and emit a structured
    /// event. Never silent.
    async fn invalidate(&self, fingerprint: &Digest, err: &Error) {
        tracing::error!(%fingerprint, error = %err, "cache integrity failure; invalidating entry");
        self.stats.integrity_events.fetch_add(1, Ordering::Relaxed);
        let mut index = self.index.write().await;
        index.remove(fingerprint);
        if let Err(persist_err) = self.persist_index(&index).await {
            tracing::warn!(error = %persist_err, "failed to persist index after invalidation");
        }
    }

    /// Memoize a successful result.
    ///
    /// The write is atomic per entry: blobs land first (staged + renamed),
    /// then the index is rewritten atomically. A failure here costs only a
    /// future miss.
    pub async fn store(
        &self,
        action: &Action,
        metadata: &BTreeMap<String, String>,
        result: &ActionResult,
    ) -> Result<()> {
        if result.status != ActionStatus::Success {
            tracing::warn!(status = ?result.status, "refusing to cache non-success result");
            return Ok(());
        }

        let fingerprint = action.fingerprint();
        let inputs = stamp_inputs(action).await?;

        let mut blobs = Vec::new();
        let mut chunked = std::collections::BTreeSet::new();
        let mut output_bytes = 0u64;
        let mut output_data: Vec<(Digest, Vec<u8>, bool)> = Vec::new();

        for (path, claimed) in &result.outputs {
            let data = tokio::fs::read(path).await?;
            let actual = Digest::of_bytes(&data);
            if actual != *claimed {
                return Err(Error::DigestMismatch {
                    expected: *claimed,
                    actual,
                });
            }
            output_bytes += data.len() as u64;
            let is_large = data.len() as u64 >= CHUNK_THRESHOLD;

            if is_large {
                let manifest = chunk::chunk(&data);
                for chunk_ref in &manifest.chunks {
                    self.write_blob(&chunk_ref.digest, manifest.slice(&data, chunk_ref))
                        .await?;
                    blobs.push(chunk_ref.digest);
                }
                let framed = codec::wrap(
                    MANIFEST_MAGIC,
                    MANIFEST_VERSION,
                    &codec::encode(&manifest)?,
                );
                self.atomic_write(&self.manifest_path(claimed), &framed)
                    .await?;
                chunked.insert(*claimed);
            } else {
                self.write_blob(claimed, &data).await?;
                blobs.push(*claimed);
            }
            output_data.push((*claimed, data, is_large));
        }

        let now = now_ms();
        let entry = CacheEntry {
            fingerprint,
            metadata_hash: action::metadata_hash(metadata),
            inputs,
            outputs: result.outputs.clone(),
            blobs,
            chunked,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            output_bytes,
            created_at_ms: now,
            last_access_ms: now,
        };

        let mut index = self.index.write().await;
        index.insert(entry.clone());
        self.persist_index(&index).await?;
        drop(index);

        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%fingerprint, "stored action result");

        // Feed the remote tier best-effort; a push failure costs only remote
        // hits elsewhere.
        if let Some(remote) = &self.remote {
            if let Err(err) = self.push_remote(remote, &entry, &output_data).await {
                tracing::warn!(%fingerprint, error = %err, "remote cache push failed");
            }
        }
        Ok(())
    }

    async fn push_remote(
        &self,
        remote: &crate::remote::RemoteCache,
        entry: &CacheEntry,
        output_data: &[(Digest, Vec<u8>, bool)],
    ) -> Result<()> {
        for (digest, data, is_large) in output_data {
            if *is_large {
                let (_, stats) = remote.push_chunked(data).await?;
                tracing::debug!(
                    %digest,
                    chunks_sent = stats.chunks_sent,
                    chunks_total = stats.chunks_total,
                    "pushed chunked blob"
                );
            } else {
                remote.put_blob(digest, data).await?;
            }
        }
        remote.put_entry(&entry.clone().sign(&self.secret)?).await
    }

    async fn persist_index(&self, index: &CacheIndex) -> Result<()> {
        let bytes = index.encode(&self.secret)?;
        self.atomic_write(&self.index_path(), &bytes).await
    }

    /// One eviction pass: drop entries past the age bound, then LRU-drop
    /// until the byte and entry-count bounds hold, then sweep blobs no
    /// surviving entry references. Serialized across processes by a coarse
    /// file lock.
    pub async fn evict(&self) -> Result<EvictOutcome> {
        let lock_path = self.root.join(".evict.lock");
        let lock_file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            fs2::FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| Error::InvariantViolation(format!("eviction lock task: {e}")))??;

        // Reload from disk: another process may have written entries.
        let mut index = CacheIndex::load(&self.index_path(), &self.secret)?;
        let mut outcome = EvictOutcome::default();
        let now = now_ms();
        let max_age_ms = self.limits.max_age.as_millis() as u64;

        // Age bound.
        let expired: Vec<Digest> = index
            .iter()
            .filter(|e| now.saturating_sub(e.created_at_ms) > max_age_ms)
            .map(|e| e.fingerprint)
            .collect();
        for fp in expired {
            index.remove(&fp);
            outcome.removed_entries += 1;
        }

        // Byte and entry-count bounds, least-recently-used first.
        while index.total_output_bytes() > self.limits.max_bytes
            || index.len() > self.limits.max_entries
        {
            let lru = index
                .iter()
                .min_by_key(|e| e.last_access_ms)
                .map(|e| e.fingerprint);
            match lru {
                Some(fp) => {
                    index.remove(&fp);
                    outcome.removed_entries += 1;
                }
                None => break,
            }
        }

        // Reference sweep: a blob survives while any entry lists it.
        let referenced: HashSet<Digest> = index.iter().flat_map(|e| e.blobs.clone()).collect();
        let referenced_manifests: HashSet<Digest> =
            index.iter().flat_map(|e| e.chunked.clone()).collect();

        outcome.removed_blobs += sweep_dir(&self.root.join("blobs"), &referenced)?;
        outcome.removed_blobs += sweep_dir(&self.root.join("manifests"), &referenced_manifests)?;

        outcome.remaining_bytes = index.total_output_bytes();
        self.persist_index(&index).await?;
        *self.index.write().await = index;
        drop(lock_file);

        self.stats
            .evicted_entries
            .fetch_add(outcome.removed_entries, Ordering::Relaxed);
        tracing::info!(
            removed_entries = outcome.removed_entries,
            removed_blobs = outcome.removed_blobs,
            remaining_bytes = outcome.remaining_bytes,
            "cache eviction pass complete"
        );
        Ok(outcome)
    }
}

/// Delete files under `dir` whose hex name is not in `keep`. Returns the
/// number removed.
fn sweep_dir(dir: &Path, keep: &HashSet<Digest>) -> Result<u64> {
    let mut removed = 0u64;
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let hex = name.strip_suffix(".bin").unwrap_or(&name);
        let digest = match Digest::from_hex(hex) {
            Ok(digest) => digest,
            // Staging leftovers or foreign files; leave them alone.
            Err(_) => continue,
        };
        if !keep.contains(&digest) {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stamp one file: size, mtime, content digest.
async fn stamp_file(path: &Path) -> Result<InputStamp> {
    let meta = tokio::fs::metadata(path).await?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(InputStamp {
        digest: Digest::from_raw([0u8; 32]),
        size: meta.len(),
        mtime_ms,
    })
}

async fn hash_file(path: &Path) -> Result<Digest> {
    let data = tokio::fs::read(path).await?;
    Ok(Digest::of_bytes(&data))
}

/// Stamp every declared input of an action, hashing content. A missing input
/// is a user error naming the target and path.
pub async fn stamp_inputs(action: &Action) -> Result<BTreeMap<String, InputStamp>> {
    let mut stamps = BTreeMap::new();
    for path in &action.inputs {
        let mut stamp = match stamp_file(path).await {
            Ok(stamp) => stamp,
            Err(_) => {
                return Err(Error::MissingInput {
                    target: action.id.target.clone(),
                    path: path.clone(),
                })
            }
        };
        stamp.digest = hash_file(path).await?;
        stamps.insert(path.to_string_lossy().into_owned(), stamp);
    }
    Ok(stamps)
}

/// Compute the canonical input digest for an action's declared inputs.
///
/// This is what drivers feed into [`buildflow_core::ActionId`]; the cache
/// revalidates the same stamps at lookup time.
pub async fn compute_input_digest(action: &Action) -> Result<Digest> {
    let stamps = stamp_inputs(action).await?;
    Ok(action::input_digest(
        stamps.iter().map(|(path, stamp)| (path.as_str(), &stamp.digest)),
    ))
}
