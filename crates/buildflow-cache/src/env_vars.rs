//! Centralized environment variable names and helpers for the cache tiers.
//!
//! The engine crate re-exports these so every binary reads the same names;
//! they live here because the cache is the lowest crate that consumes them
//! (keeping the names beside their consumers avoids a dependency cycle with
//! the engine).

// =============================================================================
// Environment Variable Name Constants
// =============================================================================

/// Local action cache size bound in bytes.
pub const ACTION_CACHE_MAX_SIZE: &str = "BUILDER_ACTION_CACHE_MAX_SIZE";
/// Local action cache entry-count bound.
pub const ACTION_CACHE_MAX_ENTRIES: &str = "BUILDER_ACTION_CACHE_MAX_ENTRIES";
/// Local action cache age bound in days.
pub const ACTION_CACHE_MAX_AGE_DAYS: &str = "BUILDER_ACTION_CACHE_MAX_AGE_DAYS";

/// Remote cache base URL; unset disables the remote tier.
pub const REMOTE_CACHE_URL: &str = "BUILDER_REMOTE_CACHE_URL";
/// Bearer token for the remote cache.
pub const REMOTE_CACHE_TOKEN: &str = "BUILDER_REMOTE_CACHE_TOKEN";
/// Per-request timeout in seconds.
pub const REMOTE_CACHE_TIMEOUT: &str = "BUILDER_REMOTE_CACHE_TIMEOUT";
/// Retry attempts for transient remote failures.
pub const REMOTE_CACHE_RETRIES: &str = "BUILDER_REMOTE_CACHE_RETRIES";
/// Connection-pool size toward the remote cache.
pub const REMOTE_CACHE_CONNECTIONS: &str = "BUILDER_REMOTE_CACHE_CONNECTIONS";
/// Largest blob, in bytes, worth uploading to the remote tier.
pub const REMOTE_CACHE_MAX_SIZE: &str = "BUILDER_REMOTE_CACHE_MAX_SIZE";
/// Compress blob transfers with gzip ("1"/"true" to enable).
pub const REMOTE_CACHE_COMPRESS: &str = "BUILDER_REMOTE_CACHE_COMPRESS";

// =============================================================================
// Typed helpers
// =============================================================================

/// Reads an environment variable as a string, returning `None` if unset.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Reads an environment variable as a `u64`, returning `default` if unset or
/// invalid.
#[must_use]
pub fn env_u64_or_default(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as a `u32`, returning `default` if unset or
/// invalid.
#[must_use]
pub fn env_u32_or_default(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as a `usize`, returning `default` if unset
/// or invalid.
#[must_use]
pub fn env_usize_or_default(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Reads a boolean environment variable; "1", "true", "yes" (any case) are
/// truthy.
#[must_use]
pub fn env_bool_or_default(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_use_builder_prefix() {
        for name in [
            ACTION_CACHE_MAX_SIZE,
            ACTION_CACHE_MAX_ENTRIES,
            ACTION_CACHE_MAX_AGE_DAYS,
            REMOTE_CACHE_URL,
            REMOTE_CACHE_TOKEN,
            REMOTE_CACHE_TIMEOUT,
            REMOTE_CACHE_RETRIES,
            REMOTE_CACHE_CONNECTIONS,
            REMOTE_CACHE_MAX_SIZE,
            REMOTE_CACHE_COMPRESS,
        ] {
            assert!(name.starts_with("BUILDER_"), "{name}");
        }
    }

    #[test]
    fn test_u64_default_on_garbage() {
        // Unset name: deterministic default.
        assert_eq!(env_u64_or_default("BUILDFLOW_TEST_UNSET_U64", 17), 17);
    }

    #[test]
    fn test_bool_parsing() {
        std::env::set_var("BUILDFLOW_TEST_BOOL", "TRUE");
        assert!(env_bool_or_default("BUILDFLOW_TEST_BOOL", false));
        std::env::set_var("BUILDFLOW_TEST_BOOL", "0");
        assert!(!env_bool_or_default("BUILDFLOW_TEST_BOOL", true));
        std::env::remove_var("BUILDFLOW_TEST_BOOL");
        assert!(env_bool_or_default("BUILDFLOW_TEST_BOOL", true));
    }
}
