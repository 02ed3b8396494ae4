//! Remote cache tier.
//!
//! Speaks a small CAS-style HTTP surface: `HEAD/GET/PUT /blobs/<hex>`,
//! `GET/PUT /manifests/<hex>`, `GET/PUT /entries/<hex>`. Large blobs move as
//! content-defined chunks, and only chunks the peer lacks (probed with HEAD)
//! are transferred; for incremental changes this typically saves the great
//! majority of the bytes. All downloaded content is re-verified against its
//! digest before use - the transport is never trusted.

use crate::chunk::{self, ChunkManifest};
use crate::entry::SignedEntry;
use crate::env_vars;
use buildflow_core::{codec, Digest, Error, Result};
use std::io::{Read, Write};
use std::time::Duration;

/// Configuration for the remote tier.
///
/// `require_same_secret` is the cross-workspace sharing policy knob: when
/// set, entries whose MAC does not verify under the local workspace secret
/// are rejected outright; when unset (the default), foreign entries are
/// accepted but every referenced blob is still digest-verified on download
/// and the entry is re-signed locally.
#[derive(Debug, Clone)]
pub struct RemoteCacheConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub connections: usize,
    /// Blobs larger than this are not uploaded.
    pub max_blob_bytes: u64,
    pub compress: bool,
    pub require_same_secret: bool,
}

impl RemoteCacheConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout: Duration::from_secs(30),
            retries: 3,
            connections: 8,
            max_blob_bytes: 64 * 1024 * 1024,
            compress: false,
            require_same_secret: false,
        }
    }

    /// Read the `BUILDER_REMOTE_CACHE_*` environment variables.
    ///
    /// Returns `None` when no URL is configured; the remote tier is then
    /// disabled.
    pub fn from_env() -> Option<Self> {
        let url = env_vars::env_string(env_vars::REMOTE_CACHE_URL)?;
        let defaults = Self::new(url);
        Some(Self {
            token: env_vars::env_string(env_vars::REMOTE_CACHE_TOKEN),
            timeout: Duration::from_secs(env_vars::env_u64_or_default(
                env_vars::REMOTE_CACHE_TIMEOUT,
                defaults.timeout.as_secs(),
            )),
            retries: env_vars::env_u32_or_default(env_vars::REMOTE_CACHE_RETRIES, defaults.retries),
            connections: env_vars::env_usize_or_default(
                env_vars::REMOTE_CACHE_CONNECTIONS,
                defaults.connections,
            ),
            max_blob_bytes: env_vars::env_u64_or_default(
                env_vars::REMOTE_CACHE_MAX_SIZE,
                defaults.max_blob_bytes,
            ),
            compress: env_vars::env_bool_or_default(
                env_vars::REMOTE_CACHE_COMPRESS,
                defaults.compress,
            ),
            ..defaults
        })
    }
}

/// What one chunked upload actually moved.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    pub chunks_total: usize,
    pub chunks_sent: usize,
    pub bytes_sent: u64,
}

/// HTTP client for the remote tier.
pub struct RemoteCache {
    http: reqwest::Client,
    config: RemoteCacheConfig,
}

impl RemoteCache {
    pub fn new(config: RemoteCacheConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.connections);

        if let Some(token) = &config.token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Config(format!("invalid remote cache token: {e}")))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Transport(format!("building http client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &RemoteCacheConfig {
        &self.config
    }

    fn endpoint(&self, kind: &str, hex: &str) -> String {
        format!("{}/{kind}/{hex}", self.config.url.trim_end_matches('/'))
    }

    /// Retry a transient-fallible operation with exponential backoff and
    /// jitter: `delay = base * 2^attempt + uniform(0, base * 2^attempt / 4)`.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let base = Duration::from_millis(100);
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.retries => {
                    let backoff = base * 2u32.saturating_pow(attempt);
                    let jitter_cap = (backoff / 4).as_millis().max(1) as u64;
                    let jitter = Duration::from_millis(rand::random::<u64>() % jitter_cap);
                    tracing::debug!(%err, attempt, ?backoff, what, "retrying remote cache operation");
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Does the peer already hold this blob?
    pub async fn has_blob(&self, digest: &Digest) -> Result<bool> {
        let url = self.endpoint("blobs", &digest.to_hex());
        self.with_retries("has_blob", || async {
            let response = self
                .http
                .head(&url)
                .send()
                .await
                .map_err(|e| Error::Transport(format!("HEAD {url}: {e}")))?;
            match response.status() {
                s if s.is_success() => Ok(true),
                s if s == reqwest::StatusCode::NOT_FOUND => Ok(false),
                s => Err(Error::Transport(format!("HEAD {url}: status {s}"))),
            }
        })
        .await
    }

    /// Download and verify one blob.
    pub async fn get_blob(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let url = self.endpoint("blobs", &digest.to_hex());
        let body = self
            .with_retries("get_blob", || async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("GET {url}: {e}")))?;
                match response.status() {
                    s if s.is_success() => {
                        let gzipped = response
                            .headers()
                            .get(reqwest::header::CONTENT_ENCODING)
                            .is_some_and(|v| v.as_bytes() == b"gzip");
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| Error::Transport(format!("GET {url} body: {e}")))?;
                        Ok(Some((bytes.to_vec(), gzipped)))
                    }
                    s if s == reqwest::StatusCode::NOT_FOUND => Ok(None),
                    s => Err(Error::Transport(format!("GET {url}: status {s}"))),
                }
            })
            .await?;

        let (data, gzipped) = match body {
            Some(pair) => pair,
            None => return Ok(None),
        };
        let data = if gzipped { gunzip(&data)? } else { data };
        if !digest.verify(&data) {
            // Integrity failure, not a miss.
            return Err(Error::DigestMismatch {
                expected: *digest,
                actual: Digest::of_bytes(&data),
            });
        }
        Ok(Some(data))
    }

    /// Upload one blob unless the peer has it or it exceeds the size bound.
    pub async fn put_blob(&self, digest: &Digest, data: &[u8]) -> Result<u64> {
        if data.len() as u64 > self.config.max_blob_bytes {
            tracing::debug!(%digest, len = data.len(), "blob exceeds remote size bound; skipping");
            return Ok(0);
        }
        if self.has_blob(digest).await? {
            return Ok(0);
        }

        let url = self.endpoint("blobs", &digest.to_hex());
        let (body, encoding) = if self.config.compress {
            (gzip(data)?, Some("gzip"))
        } else {
            (data.to_vec(), None)
        };
        let sent = body.len() as u64;

        self.with_retries("put_blob", || {
            let http = self.http.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                let mut request = http.put(&url).body(body);
                if let Some(encoding) = encoding {
                    request = request.header(reqwest::header::CONTENT_ENCODING, encoding);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("PUT {url}: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::Transport(format!(
                        "PUT {url}: status {}",
                        response.status()
                    )));
                }
                Ok(())
            }
        })
        .await?;
        Ok(sent)
    }

    /// Fetch a signed entry by fingerprint.
    pub async fn get_entry(&self, fingerprint: &Digest) -> Result<Option<SignedEntry>> {
        let url = self.endpoint("entries", &fingerprint.to_hex());
        let body = self
            .with_retries("get_entry", || async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("GET {url}: {e}")))?;
                match response.status() {
                    s if s.is_success() => Ok(Some(
                        response
                            .bytes()
                            .await
                            .map_err(|e| Error::Transport(format!("GET {url} body: {e}")))?
                            .to_vec(),
                    )),
                    s if s == reqwest::StatusCode::NOT_FOUND => Ok(None),
                    s => Err(Error::Transport(format!("GET {url}: status {s}"))),
                }
            })
            .await?;
        match body {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Publish a signed entry.
    pub async fn put_entry(&self, entry: &SignedEntry) -> Result<()> {
        let url = self.endpoint("entries", &entry.entry.fingerprint.to_hex());
        let body = codec::encode(entry)?;
        self.with_retries("put_entry", || {
            let http = self.http.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                let response = http
                    .put(&url)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("PUT {url}: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::Transport(format!(
                        "PUT {url}: status {}",
                        response.status()
                    )));
                }
                Ok(())
            }
        })
        .await
    }

    /// Fetch a chunk manifest for a large blob.
    pub async fn get_manifest(&self, blob_digest: &Digest) -> Result<Option<ChunkManifest>> {
        let url = self.endpoint("manifests", &blob_digest.to_hex());
        let body = self
            .with_retries("get_manifest", || async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("GET {url}: {e}")))?;
                match response.status() {
                    s if s.is_success() => Ok(Some(
                        response
                            .bytes()
                            .await
                            .map_err(|e| Error::Transport(format!("GET {url} body: {e}")))?
                            .to_vec(),
                    )),
                    s if s == reqwest::StatusCode::NOT_FOUND => Ok(None),
                    s => Err(Error::Transport(format!("GET {url}: status {s}"))),
                }
            })
            .await?;
        match body {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Upload a large blob as content-defined chunks, skipping chunks the
    /// peer already holds, then publish the manifest.
    pub async fn push_chunked(&self, data: &[u8]) -> Result<(ChunkManifest, TransferStats)> {
        let manifest = chunk::chunk(data);
        let mut stats = TransferStats {
            chunks_total: manifest.chunks.len(),
            ..TransferStats::default()
        };

        for chunk_ref in &manifest.chunks {
            let piece = manifest.slice(data, chunk_ref);
            let sent = self.put_blob(&chunk_ref.digest, piece).await?;
            if sent > 0 {
                stats.chunks_sent += 1;
                stats.bytes_sent += sent;
            }
        }

        let url = self.endpoint("manifests", &manifest.blob_digest.to_hex());
        let body = codec::encode(&manifest)?;
        self.with_retries("put_manifest", || {
            let http = self.http.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                let response = http
                    .put(&url)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("PUT {url}: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::Transport(format!(
                        "PUT {url}: status {}",
                        response.status()
                    )));
                }
                Ok(())
            }
        })
        .await?;

        tracing::debug!(
            blob = %manifest.blob_digest,
            chunks_total = stats.chunks_total,
            chunks_sent = stats.chunks_sent,
            bytes_sent = stats.bytes_sent,
            "chunked upload complete"
        );
        Ok((manifest, stats))
    }

    /// Download a chunked blob via its manifest and reassemble it,
    /// verifying every chunk and the whole.
    pub async fn pull_chunked(&self, blob_digest: &Digest) -> Result<Option<Vec<u8>>> {
        let manifest = match self.get_manifest(blob_digest).await? {
            Some(manifest) => manifest,
            None => return Ok(None),
        };
        let mut out = Vec::with_capacity(manifest.total_len as usize);
        for chunk_ref in &manifest.chunks {
            let piece = self.get_blob(&chunk_ref.digest).await?.ok_or_else(|| {
                Error::CacheCorrupted(format!(
                    "manifest {blob_digest} references missing chunk {}",
                    chunk_ref.digest
                ))
            })?;
            out.extend_from_slice(&piece);
        }
        if !blob_digest.verify(&out) {
            return Err(Error::DigestMismatch {
                expected: *blob_digest,
                actual: Digest::of_bytes(&out),
            });
        }
        Ok(Some(out))
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> RemoteCacheConfig {
        let mut config = RemoteCacheConfig::new(server.uri());
        config.retries = 0;
        config
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = b"compressible compressible compressible".repeat(100);
        let packed = gzip(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gunzip(&packed).unwrap(), data);
    }

    #[test]
    fn test_from_env_disabled_without_url() {
        std::env::remove_var(env_vars::REMOTE_CACHE_URL);
        assert!(RemoteCacheConfig::from_env().is_none());
    }

    #[tokio::test]
    async fn test_has_blob_maps_status() {
        let server = MockServer::start().await;
        let digest = Digest::of_bytes(b"present");
        Mock::given(method("HEAD"))
            .and(path(format!("/blobs/{}", digest.to_hex())))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let missing = Digest::of_bytes(b"absent");
        Mock::given(method("HEAD"))
            .and(path(format!("/blobs/{}", missing.to_hex())))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let remote = RemoteCache::new(config_for(&server)).unwrap();
        assert!(remote.has_blob(&digest).await.unwrap());
        assert!(!remote.has_blob(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_blob_verifies_digest() {
        let server = MockServer::start().await;
        let good = Digest::of_bytes(b"good bytes");
        Mock::given(method("GET"))
            .and(path(format!("/blobs/{}", good.to_hex())))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"good bytes".to_vec()))
            .mount(&server)
            .await;
        let lying = Digest::of_bytes(b"claimed content");
        Mock::given(method("GET"))
            .and(path(format!("/blobs/{}", lying.to_hex())))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"other content".to_vec()))
            .mount(&server)
            .await;

        let remote = RemoteCache::new(config_for(&server)).unwrap();
        assert_eq!(
            remote.get_blob(&good).await.unwrap().unwrap(),
            b"good bytes"
        );
        let err = remote.get_blob(&lying).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_put_blob_skips_existing() {
        let server = MockServer::start().await;
        let digest = Digest::of_bytes(b"already there");
        Mock::given(method("HEAD"))
            .and(path(format!("/blobs/{}", digest.to_hex())))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        // No PUT mock mounted: a PUT attempt would 404 and error out.

        let remote = RemoteCache::new(config_for(&server)).unwrap();
        let sent = remote.put_blob(&digest, b"already there").await.unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_put_blob_respects_size_bound() {
        let server = MockServer::start().await;
        let mut config = config_for(&server);
        config.max_blob_bytes = 4;
        let remote = RemoteCache::new(config).unwrap();

        let digest = Digest::of_bytes(b"way too large");
        let sent = remote.put_blob(&digest, b"way too large").await.unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let server = MockServer::start().await;
        let digest = Digest::of_bytes(b"flaky");
        Mock::given(method("HEAD"))
            .and(path(format!("/blobs/{}", digest.to_hex())))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("/blobs/{}", digest.to_hex())))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.retries = 2;
        let remote = RemoteCache::new(config).unwrap();
        assert!(remote.has_blob(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_entry_absent() {
        let server = MockServer::start().await;
        let fp = Digest::of_bytes(b"no entry");
        Mock::given(method("GET"))
            .and(path(format!("/entries/{}", fp.to_hex())))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let remote = RemoteCache::new(config_for(&server)).unwrap();
        assert!(remote.get_entry(&fp).await.unwrap().is_none());
    }
}
