//! Engine configuration: env-var driven, programmatically overridable.
//!
//! Env-var names and typed helpers for the cache tiers live in
//! `buildflow_cache::env_vars` (beside their consumers) and are re-exported
//! here so binaries have a single import surface.

use buildflow_cache::{CacheLimits, RemoteCacheConfig};
use buildflow_core::{Error, Result};
use buildflow_dist::RetryPolicy;
use buildflow_graph::FailurePolicy;
use std::path::{Path, PathBuf};

pub use buildflow_cache::env_vars;

/// Everything a build session needs to know beyond the graph itself.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub failure_policy: FailurePolicy,
    /// Local worker count.
    pub parallelism: usize,
    /// Cache directory (index, blobs, manifests, workspace secret).
    pub cache_root: PathBuf,
    pub cache_limits: CacheLimits,
    /// Remote tier; `None` disables it.
    pub remote_cache: Option<RemoteCacheConfig>,
    pub retry: RetryPolicy,
}

impl BuildConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            parallelism: num_cpus(),
            cache_root: cache_root.into(),
            cache_limits: CacheLimits::default(),
            remote_cache: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Read the `BUILDER_*` environment variables on top of defaults.
    pub fn from_env(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_limits: CacheLimits::from_env(),
            remote_cache: RemoteCacheConfig::from_env(),
            ..Self::new(cache_root)
        }
    }

    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers.max(1);
        self
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Load the workspace-bound cache secret, creating it on first use.
///
/// The secret keys the MAC on every cache entry; it lives beside the cache
/// with owner-only permissions.
pub fn workspace_secret(cache_root: &Path) -> Result<[u8; 32]> {
    let path = cache_root.join("secret.key");
    match std::fs::read(&path) {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes.try_into().map_err(|_| {
                Error::Config(format!(
                    "workspace secret at {} is not 32 bytes; delete it to regenerate",
                    path.display()
                ))
            })?;
            Ok(secret)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(cache_root)?;
            let secret: [u8; 32] = rand::random();
            std::fs::write(&path, secret)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            Ok(secret)
        }
        Err(e) => Err(e.into()),
    }
}
