//! Typed error taxonomy for the build engine kernel.
//!
//! Every fallible operation returns `Result<T, Error>`; errors never unwind
//! through component boundaries opaquely. Each variant carries enough context
//! (target, path, worker) for an operator to act on, and classifies into one
//! of five kinds via [`Error::class`]:
//!
//! - `User` - malformed input (duplicate target, cycle, missing input).
//! - `Action` - the action ran and failed; propagates via failure-propagation.
//! - `Transient` - transport failures, dead workers, timeouts; retryable.
//! - `Integrity` - corruption or digest mismatch; never silently recovered.
//! - `Fatal` - invariant violation; the process aborts with exit code 4.

use crate::action::TargetId;
use crate::digest::Digest;
use std::path::PathBuf;
use thiserror::Error;

/// Kernel result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which resource limit an action breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDimension {
    Memory,
    CpuTime,
    WallTime,
}

impl std::fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitDimension::Memory => "memory",
            LimitDimension::CpuTime => "cpu time",
            LimitDimension::WallTime => "wall time",
        };
        f.write_str(s)
    }
}

/// Errors that can occur anywhere in the kernel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // --- User errors -------------------------------------------------------
    /// A target with this id was already added to the graph.
    #[error("duplicate target: {0}")]
    DuplicateTarget(TargetId),

    /// An operation referenced a target the graph does not contain.
    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    /// Adding the edge would close a directed cycle; the edge was not added.
    #[error("dependency cycle detected: {}", format_cycle(path))]
    CycleDetected { path: Vec<TargetId> },

    /// A declared input does not exist on disk.
    #[error("missing declared input for {target}: {path}")]
    MissingInput { target: TargetId, path: PathBuf },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    // --- Action errors -----------------------------------------------------
    /// The action ran and exited nonzero.
    #[error("action for {target} failed with exit code {exit_code}")]
    ActionFailed { target: TargetId, exit_code: i32 },

    /// The action exited successfully but did not produce a declared output.
    #[error("action for {target} did not produce declared output {path}")]
    MissingDeclaredOutput { target: TargetId, path: PathBuf },

    /// The action breached a hard resource limit.
    #[error("action for {target} exceeded its {dimension} limit")]
    ResourceLimitExceeded {
        target: TargetId,
        dimension: LimitDimension,
    },

    /// Retries were exhausted for a transient failure; the last cause is kept.
    #[error("action for {target} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        target: TargetId,
        attempts: u32,
        last_error: String,
    },

    // --- Transient errors --------------------------------------------------
    /// A transport-level failure (connect, read, write, frame).
    #[error("transport error: {0}")]
    Transport(String),

    /// The worker executing the action stopped heartbeating mid-execution.
    #[error("worker {worker_id} died mid-execution")]
    WorkerDead { worker_id: String },

    /// The action hit its wall-clock deadline and was killed.
    #[error("action for {target} timed out after {wall_ms}ms")]
    Timeout { target: TargetId, wall_ms: u64 },

    /// An I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // --- Integrity errors --------------------------------------------------
    /// A cache entry failed its MAC or structural validation.
    #[error("cache corrupted: {0}")]
    CacheCorrupted(String),

    /// Downloaded or stored content does not match its claimed digest.
    #[error("content digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// A digest string could not be parsed.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Binary decoding of persisted or framed data failed.
    #[error("codec error: {0}")]
    Codec(String),

    // --- Fatal -------------------------------------------------------------
    /// An internal invariant was violated; state is included for post-mortem.
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),
}

/// The five error kinds; drives retry and exit-code policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    User,
    Action,
    Transient,
    Integrity,
    Fatal,
}

impl Error {
    /// Classify this error into its taxonomy kind.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::DuplicateTarget(_)
            | Error::UnknownTarget(_)
            | Error::CycleDetected { .. }
            | Error::MissingInput { .. }
            | Error::Config(_) => ErrorClass::User,

            Error::ActionFailed { .. }
            | Error::MissingDeclaredOutput { .. }
            | Error::ResourceLimitExceeded { .. }
            | Error::RetriesExhausted { .. } => ErrorClass::Action,

            Error::Transport(_)
            | Error::WorkerDead { .. }
            | Error::Timeout { .. }
            | Error::Io(_) => ErrorClass::Transient,

            Error::CacheCorrupted(_)
            | Error::DigestMismatch { .. }
            | Error::InvalidDigest(_)
            | Error::Codec(_) => ErrorClass::Integrity,

            Error::InvariantViolation(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the dispatch layer may retry the failed action.
    ///
    /// Only transient failures are retryable; a missing declared output is an
    /// action failure and is never retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map this error to the process exit code contract:
    /// 1 = action failure, 2 = cycle, 3 = configuration/user error,
    /// 4 = internal invariant violation.
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::User => match self {
                Error::CycleDetected { .. } => 2,
                _ => 3,
            },
            ErrorClass::Action | ErrorClass::Transient | ErrorClass::Integrity => 1,
            ErrorClass::Fatal => 4,
        }
    }

    /// One concrete suggestion for the common error codes, surfaced in
    /// user-facing reports.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::CycleDetected { .. } => {
                Some("export the graph with to_dot() and inspect the reported cycle path")
            }
            Error::MissingInput { .. } => {
                Some("check the source globs of the named target; the file may have moved")
            }
            Error::DuplicateTarget(_) => {
                Some("two manifests declare the same target id; rename one of them")
            }
            Error::CacheCorrupted(_) => {
                Some("the entry was ignored and will be rebuilt; if this repeats, clear the cache directory")
            }
            _ => None,
        }
    }
}

fn format_cycle(path: &[TargetId]) -> String {
    path.iter()
        .map(TargetId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
