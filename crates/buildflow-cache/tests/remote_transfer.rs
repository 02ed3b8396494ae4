//! Incremental chunked transfer against a CAS-style peer.
//!
//! Drives the remote tier end to end with an in-memory blob server: a full
//! upload, an incremental re-upload after a small edit (which must move only
//! a small fraction of the bytes), and a verified reassembly on the way back.

use buildflow_cache::{RemoteCache, RemoteCacheConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

type Blobs = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Mount an in-memory CAS on the mock server: HEAD/GET/PUT under /blobs and
/// /manifests, keyed by path.
async fn mount_cas(server: &MockServer) -> Blobs {
    let blobs: Blobs = Arc::new(Mutex::new(HashMap::new()));
    let state = Arc::clone(&blobs);

    let responder = move |req: &wiremock::Request| {
        let key = req.url.path().to_string();
        let mut store = state.lock().unwrap();
        match req.method.as_str() {
            "HEAD" => {
                if store.contains_key(&key) {
                    ResponseTemplate::new(200)
                } else {
                    ResponseTemplate::new(404)
                }
            }
            "GET" => match store.get(&key) {
                Some(data) => ResponseTemplate::new(200).set_body_bytes(data.clone()),
                None => ResponseTemplate::new(404),
            },
            "PUT" => {
                store.insert(key, req.body.clone());
                ResponseTemplate::new(200)
            }
            _ => ResponseTemplate::new(405),
        }
    };

    Mock::given(any()).respond_with(responder).mount(server).await;
    blobs
}

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

#[tokio::test]
async fn test_incremental_chunked_upload_reuses_peer_chunks() {
    let server = MockServer::start().await;
    mount_cas(&server).await;

    let mut config = RemoteCacheConfig::new(server.uri());
    config.retries = 0;
    let remote = RemoteCache::new(config).unwrap();

    // Cold upload of a 10 MiB blob: everything moves.
    let mut data = pseudo_random(10 * 1024 * 1024, 2024);
    let (first_manifest, first) = remote.push_chunked(&data).await.unwrap();
    assert_eq!(first.chunks_sent, first.chunks_total);
    assert!(first.bytes_sent >= data.len() as u64);

    // Modify 4 KiB in the middle and upload again.
    let mid = data.len() / 2;
    for byte in &mut data[mid..mid + 4096] {
        *byte = byte.wrapping_add(1);
    }
    let (second_manifest, second) = remote.push_chunked(&data).await.unwrap();

    // At least 95% of the chunks are already on the peer, and the bytes on
    // the wire are a small fraction of the blob.
    let reused = second.chunks_total - second.chunks_sent;
    let reuse_ratio = reused as f64 / second.chunks_total as f64;
    assert!(
        reuse_ratio >= 0.95,
        "only {reused}/{} chunks reused",
        second.chunks_total
    );
    assert!(
        second.bytes_sent < data.len() as u64 / 10,
        "sent {} of {} bytes",
        second.bytes_sent,
        data.len()
    );
    assert_ne!(first_manifest.blob_digest, second_manifest.blob_digest);

    // The peer can hand the new content back byte-identical.
    let rebuilt = remote
        .pull_chunked(&second_manifest.blob_digest)
        .await
        .unwrap()
        .expect("manifest on peer");
    assert_eq!(rebuilt, data);
}

#[tokio::test]
async fn test_pull_chunked_unknown_blob_is_none() {
    let server = MockServer::start().await;
    mount_cas(&server).await;

    let mut config = RemoteCacheConfig::new(server.uri());
    config.retries = 0;
    let remote = RemoteCache::new(config).unwrap();

    let absent = buildflow_core::Digest::of_bytes(b"never uploaded");
    assert!(remote.pull_chunked(&absent).await.unwrap().is_none());
}
