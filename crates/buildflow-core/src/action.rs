//! The action data model: targets, actions, results, fingerprints.
//!
//! A `Target` is the declarative unit external producers hand to the engine.
//! An `Action` is one concrete invocation of an external command with declared
//! inputs and outputs; its `ActionId` fingerprint is the cache key. Actions
//! and `ActionResult`s are value types passed by move across component
//! boundaries.

use crate::digest::{Digest, DigestHasher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Unique identifier of a build target.
///
/// Ordered lexicographically; the scheduler uses this ordering as the
/// deterministic tie-break in topological sorts.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Debug output reads better as the bare id in graph dumps.
impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What kind of artifact a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Executable,
    Library,
    Test,
    Custom,
}

/// Declarative unit emitted by manifest parsers.
///
/// The per-language configuration bag is opaque to the kernel and hashed
/// as-is into fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    /// Source path patterns, in declaration order.
    pub sources: Vec<String>,
    /// Direct dependencies, in declaration order.
    pub deps: Vec<TargetId>,
    /// Language tag (e.g. "rust", "go"); opaque to the kernel.
    pub language: String,
    /// Per-language configuration; keys unique, iteration order canonical.
    pub config: BTreeMap<String, String>,
}

impl Target {
    pub fn new(id: impl Into<TargetId>, kind: TargetKind) -> Self {
        Self {
            id: id.into(),
            kind,
            sources: Vec::new(),
            deps: Vec::new(),
            language: String::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = TargetId>) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// The phase of work an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Compile,
    Link,
    Codegen,
    Test,
    Custom,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Compile => "compile",
            ActionKind::Link => "link",
            ActionKind::Codegen => "codegen",
            ActionKind::Test => "test",
            ActionKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Format tag mixed into every fingerprint so digests from incompatible
/// fingerprint schemes never collide.
const FINGERPRINT_TAG: &[u8] = b"buildflow.fingerprint";
const FINGERPRINT_VERSION: u8 = 1;

/// Separator between path and digest in the canonical input encoding.
/// NUL cannot occur in a UTF-8 path, so the encoding is unambiguous.
const FIELD_SEPARATOR: u8 = 0;

/// Canonical identity of an action; the cache key.
///
/// The tuple `(target, kind, sub_id, input_digest)` uniquely identifies one
/// unit of execution. `sub_id` disambiguates per-file actions (e.g. the
/// source path for per-file compilation) and is empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId {
    pub target: TargetId,
    pub kind: ActionKind,
    pub sub_id: String,
    pub input_digest: Digest,
}

impl ActionId {
    pub fn new(
        target: impl Into<TargetId>,
        kind: ActionKind,
        sub_id: impl Into<String>,
        input_digest: Digest,
    ) -> Self {
        Self {
            target: target.into(),
            kind,
            sub_id: sub_id.into(),
            input_digest,
        }
    }

    /// Collapse the identity tuple into a single digest usable as a map key
    /// and on-disk name.
    pub fn fingerprint(&self) -> Digest {
        let mut hasher = DigestHasher::new();
        hasher.update(FINGERPRINT_TAG);
        hasher.update(&[FINGERPRINT_VERSION]);
        hasher.update(self.target.as_str().as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(self.sub_id.as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(self.input_digest.as_bytes());
        hasher.finalize()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sub_id.is_empty() {
            write!(f, "{}:{}", self.target, self.kind)
        } else {
            write!(f, "{}:{}:{}", self.target, self.kind, self.sub_id)
        }
    }
}

/// Compute the canonical input digest over declared inputs.
///
/// Inputs are visited in lexicographic path order so the digest is
/// independent of declaration order: for each input the UTF-8 path, a NUL
/// separator, and the input's content digest are fed to the hasher, preceded
/// by the format header.
pub fn input_digest<'a>(inputs: impl IntoIterator<Item = (&'a str, &'a Digest)>) -> Digest {
    let mut sorted: Vec<(&str, &Digest)> = inputs.into_iter().collect();
    sorted.sort_by_key(|(path, _)| *path);

    let mut hasher = DigestHasher::new();
    hasher.update(FINGERPRINT_TAG);
    hasher.update(&[FINGERPRINT_VERSION]);
    for (path, digest) in sorted {
        hasher.update(path.as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(digest.as_bytes());
    }
    hasher.finalize()
}

/// Canonical digest of an opaque metadata map (keys sorted, which `BTreeMap`
/// iteration already guarantees).
pub fn metadata_hash(metadata: &BTreeMap<String, String>) -> Digest {
    let mut hasher = DigestHasher::new();
    hasher.update(b"buildflow.metadata");
    hasher.update(&[FINGERPRINT_VERSION]);
    for (key, value) in metadata {
        hasher.update(key.as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(value.as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
    }
    hasher.finalize()
}

/// Hard resource limits applied to an action's process.
///
/// CPU time and wall time are distinct dimensions: CPU time is
/// process-accumulated and enforced via RLIMIT_CPU; wall time is a monotonic
/// deadline enforced by the sandbox timer. A `wall_timeout_ms` of zero
/// disables the deadline entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_time_ms: Option<u64>,
    pub wall_timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: None,
            max_cpu_time_ms: None,
            // 10 minutes; generous for compile steps, finite by default.
            wall_timeout_ms: 600_000,
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: None,
            max_cpu_time_ms: None,
            wall_timeout_ms: 0,
        }
    }
}

/// The unit of execution dispatched to workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub argv: Vec<String>,
    /// Declared input paths (read-only inside the sandbox).
    pub inputs: BTreeSet<PathBuf>,
    /// Declared output paths (writable inside the sandbox).
    pub outputs: BTreeSet<PathBuf>,
    /// Declared temp paths (writable, discarded on exit).
    pub temps: BTreeSet<PathBuf>,
    /// Environment visible to the action; nothing else leaks in.
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    /// When set, no external network is reachable from the sandbox.
    pub network_hermetic: bool,
    /// Explicit scheduling priority hint (higher runs earlier).
    pub priority: u8,
    /// Estimated cost in milliseconds, when the producer knows it.
    pub cost_hint_ms: Option<u32>,
}

impl Action {
    pub fn new(id: ActionId, argv: Vec<String>) -> Self {
        Self {
            id,
            argv,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            temps: BTreeSet::new(),
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
            network_hermetic: true,
            priority: 0,
            cost_hint_ms: None,
        }
    }

    pub fn fingerprint(&self) -> Digest {
        self.id.fingerprint()
    }
}

/// Terminal status of one action execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

/// Observed resource consumption of one action execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
}

/// Where and how a result was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub worker_id: String,
    /// Set when the result was served from a cache tier rather than executed.
    pub cached_from: Option<String>,
}

/// The outcome of one action, returned to the scheduler and cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    /// Process exit code; 0 on cache hit.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Produced output paths with their content digests.
    pub outputs: BTreeMap<PathBuf, Digest>,
    pub usage: ResourceUsage,
    pub metadata: ExecutionMetadata,
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> Digest {
        Digest::of_bytes(&[n])
    }

    #[test]
    fn test_input_digest_order_independent() {
        let a = digest(1);
        let b = digest(2);
        let forward = input_digest(vec![("src/a.rs", &a), ("src/b.rs", &b)]);
        let reverse = input_digest(vec![("src/b.rs", &b), ("src/a.rs", &a)]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_input_digest_sensitive_to_content() {
        let a = digest(1);
        let changed = digest(9);
        let before = input_digest(vec![("src/a.rs", &a)]);
        let after = input_digest(vec![("src/a.rs", &changed)]);
        assert_ne!(before, after);
    }

    #[test]
    fn test_input_digest_sensitive_to_path() {
        let a = digest(1);
        assert_ne!(
            input_digest(vec![("src/a.rs", &a)]),
            input_digest(vec![("src/b.rs", &a)]),
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_sub_id() {
        let inputs = digest(1);
        let compile_a = ActionId::new("lib", ActionKind::Compile, "src/a.rs", inputs);
        let compile_b = ActionId::new("lib", ActionKind::Compile, "src/b.rs", inputs);
        assert_ne!(compile_a.fingerprint(), compile_b.fingerprint());
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let id = ActionId::new("app", ActionKind::Link, "", digest(3));
        assert_eq!(id.fingerprint(), id.clone().fingerprint());
    }

    #[test]
    fn test_metadata_hash_ignores_insertion_order() {
        let mut forward = BTreeMap::new();
        forward.insert("opt".to_string(), "2".to_string());
        forward.insert("debug".to_string(), "true".to_string());

        let mut reverse = BTreeMap::new();
        reverse.insert("debug".to_string(), "true".to_string());
        reverse.insert("opt".to_string(), "2".to_string());

        assert_eq!(metadata_hash(&forward), metadata_hash(&reverse));
    }

    #[test]
    fn test_metadata_hash_unambiguous_boundaries() {
        // ("a", "bc") must not hash like ("ab", "c").
        let mut one = BTreeMap::new();
        one.insert("a".to_string(), "bc".to_string());
        let mut two = BTreeMap::new();
        two.insert("ab".to_string(), "c".to_string());
        assert_ne!(metadata_hash(&one), metadata_hash(&two));
    }

    #[test]
    fn test_target_id_ordering_is_lexicographic() {
        let mut ids = vec![TargetId::from("c"), TargetId::from("a"), TargetId::from("b")];
        ids.sort();
        let names: Vec<&str> = ids.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_action_round_trip_bincode() {
        let id = ActionId::new("app", ActionKind::Test, "", digest(7));
        let mut action = Action::new(id, vec!["sh".into(), "-c".into(), "true".into()]);
        action.inputs.insert(PathBuf::from("src/main.rs"));
        action.outputs.insert(PathBuf::from("out/app"));
        action.env.insert("PATH".into(), "/usr/bin".into());

        let bytes = bincode::serialize(&action).unwrap();
        let decoded: Action = bincode::deserialize(&bytes).unwrap();
        assert_eq!(action, decoded);
    }
}
