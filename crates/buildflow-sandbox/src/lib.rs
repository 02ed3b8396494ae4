//! Hermetic sandbox runtime.
//!
//! Executes one action so that behavior and outputs depend only on declared
//! inputs, environment, and argv. Two backends share one process runner:
//!
//! - **Hermetic**: a per-action execution root (randomized temp directory)
//!   into which declared inputs are materialized read-only, with declared
//!   outputs and temps writable, the environment scrubbed to the declared
//!   map, resource limits enforced as hard rlimits, and (where the platform
//!   permits) network and pid namespace isolation. Where namespaces are
//!   unavailable the sandbox falls back to session-based (name-based)
//!   isolation, a documented weaker guarantee.
//! - **Host**: executes in the host environment with timeout and capture
//!   only. Must be explicitly selected; exists for development.
//!
//! Cleanup is guaranteed on all exit paths: execution roots are owned
//! `TempDir` guards removed on drop unless diagnostics retention is
//! requested. Timeouts run a graceful-termination sequence (SIGTERM, grace
//! window, SIGKILL) against the action's process group.

mod capabilities;
mod exec;
mod hermetic;
mod host;

pub use capabilities::SandboxCapabilities;

use buildflow_core::{Action, ActionResult, CancellationToken, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Which isolation backend executes actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxMode {
    /// Isolated execution root, scrubbed environment, hard limits.
    #[default]
    Hermetic,
    /// No isolation; host environment. Explicit opt-in only.
    Host,
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxMode::Hermetic => f.write_str("hermetic"),
            SandboxMode::Host => f.write_str("host"),
        }
    }
}

/// Builder for [`Sandbox`].
#[derive(Debug)]
pub struct SandboxBuilder {
    mode: SandboxMode,
    workspace_root: PathBuf,
    grace: Duration,
    keep_diagnostics: bool,
    drop_privileges: bool,
}

impl SandboxBuilder {
    fn new() -> Self {
        Self {
            mode: SandboxMode::Hermetic,
            workspace_root: PathBuf::from("."),
            grace: Duration::from_secs(2),
            keep_diagnostics: false,
            drop_privileges: false,
        }
    }

    /// Select the backend. [`SandboxMode::Host`] disables isolation and must
    /// be chosen deliberately.
    #[must_use]
    pub fn mode(mut self, mode: SandboxMode) -> Self {
        self.mode = mode;
        self
    }

    /// Root against which workspace-relative declared paths resolve.
    #[must_use]
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Window between the polite SIGTERM and the forced SIGKILL.
    #[must_use]
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Retain execution roots on disk for post-mortem inspection.
    #[must_use]
    pub fn keep_diagnostics(mut self, keep: bool) -> Self {
        self.keep_diagnostics = keep;
        self
    }

    /// When running privileged, execute actions as an unprivileged principal.
    #[must_use]
    pub fn drop_privileges(mut self, drop: bool) -> Self {
        self.drop_privileges = drop;
        self
    }

    pub fn build(self) -> Sandbox {
        let capabilities = SandboxCapabilities::detect();
        if self.mode == SandboxMode::Hermetic && !capabilities.namespaces_available() {
            tracing::warn!(
                platform = %capabilities.platform,
                "namespace isolation unavailable; falling back to session-based isolation"
            );
        }
        Sandbox {
            mode: self.mode,
            workspace_root: self.workspace_root,
            grace: self.grace,
            keep_diagnostics: self.keep_diagnostics,
            drop_privileges: self.drop_privileges,
            capabilities,
        }
    }
}

/// The sandbox runtime handed to workers.
#[derive(Debug)]
pub struct Sandbox {
    mode: SandboxMode,
    workspace_root: PathBuf,
    grace: Duration,
    keep_diagnostics: bool,
    drop_privileges: bool,
    capabilities: SandboxCapabilities,
}

impl Sandbox {
    #[must_use]
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    #[must_use]
    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    #[must_use]
    pub fn capabilities(&self) -> &SandboxCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn workspace_root(&self) -> &std::path::Path {
        &self.workspace_root
    }

    /// Execute one action to completion (or timeout/cancellation).
    ///
    /// The returned result reports captured streams byte-exactly, the exit
    /// code, a best-effort resource-usage snapshot, and the digests of every
    /// file found under the declared output paths. Declared-output
    /// completeness is the caller's check; the sandbox reports what exists.
    pub async fn execute(&self, action: &Action, cancel: &CancellationToken) -> Result<ActionResult> {
        match self.mode {
            SandboxMode::Hermetic => hermetic::execute(self, action, cancel).await,
            SandboxMode::Host => host::execute(self, action, cancel).await,
        }
    }

    pub(crate) fn grace(&self) -> Duration {
        self.grace
    }

    pub(crate) fn keep_diagnostics(&self) -> bool {
        self.keep_diagnostics
    }

    pub(crate) fn drop_privileges_requested(&self) -> bool {
        self.drop_privileges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let sandbox = Sandbox::builder().build();
        assert_eq!(sandbox.mode(), SandboxMode::Hermetic);
        assert!(!sandbox.keep_diagnostics());
    }

    #[test]
    fn test_builder_chain() {
        let sandbox = Sandbox::builder()
            .mode(SandboxMode::Host)
            .workspace_root("/tmp/ws")
            .grace(Duration::from_millis(500))
            .keep_diagnostics(true)
            .drop_privileges(true)
            .build();
        assert_eq!(sandbox.mode(), SandboxMode::Host);
        assert_eq!(sandbox.workspace_root(), std::path::Path::new("/tmp/ws"));
        assert!(sandbox.keep_diagnostics());
        assert!(sandbox.drop_privileges_requested());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(SandboxMode::Hermetic.to_string(), "hermetic");
        assert_eq!(SandboxMode::Host.to_string(), "host");
    }
}
