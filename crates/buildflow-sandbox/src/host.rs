//! The explicit no-sandbox backend.
//!
//! Executes in the host environment: no filesystem materialization, no
//! namespace isolation. Timeout enforcement, stream capture, resource limits,
//! and output collection still apply, so results keep the same shape as the
//! hermetic backend's.

use crate::exec::{self, ProcessSpec};
use crate::Sandbox;
use buildflow_core::{Action, ActionResult, CancellationToken, Digest, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub(crate) async fn execute(
    sandbox: &Sandbox,
    action: &Action,
    cancel: &CancellationToken,
) -> Result<ActionResult> {
    let workspace = sandbox.workspace_root();
    let tmp = std::env::temp_dir();

    let spec = ProcessSpec {
        argv: action.argv.clone(),
        cwd: workspace.to_path_buf(),
        env: ProcessSpec::scrubbed_env(action, &tmp),
        limits: action.limits,
        network_hermetic: false,
        drop_privileges: sandbox.drop_privileges_requested(),
    };

    let outcome = exec::run_process(spec, cancel, sandbox.grace()).await?;

    let mut outputs = BTreeMap::new();
    if matches!(outcome.kind, crate::exec::ExitKind::Exited(0)) {
        for declared in &action.outputs {
            let resolved = resolve(workspace, declared);
            for (path, digest) in collect_files(&resolved)? {
                outputs.insert(path, digest);
            }
        }
    }

    Ok(exec::assemble_result(outcome, outputs))
}

/// Resolve a declared path against the workspace root.
pub(crate) fn resolve(workspace: &Path, declared: &Path) -> PathBuf {
    if declared.is_absolute() {
        declared.to_path_buf()
    } else {
        workspace.join(declared)
    }
}

/// Every file at or under `path`, with its content digest. A missing path
/// yields nothing; declared-output completeness is checked by the caller.
pub(crate) fn collect_files(path: &Path) -> Result<Vec<(PathBuf, Digest)>> {
    let mut found = Vec::new();
    if !path.exists() {
        return Ok(found);
    }
    if path.is_file() {
        let data = std::fs::read(path)?;
        found.push((path.to_path_buf(), Digest::of_bytes(&data)));
        return Ok(found);
    }
    for entry in walkdir::WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            let data = std::fs::read(entry.path())?;
            found.push((entry.path().to_path_buf(), Digest::of_bytes(&data)));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SandboxMode;
    use buildflow_core::{ActionId, ActionKind, ActionStatus};

    fn host_sandbox(root: &Path) -> Sandbox {
        Sandbox::builder()
            .mode(SandboxMode::Host)
            .workspace_root(root)
            .build()
    }

    fn sh_action(name: &str, script: &str) -> Action {
        Action::new(
            ActionId::new(name, ActionKind::Custom, "", Digest::of_bytes(b"")),
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_host_executes_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let cancel = CancellationToken::new();

        let action = sh_action("echo", "printf hello");
        let result = sandbox.execute(&action, &cancel).await.unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_host_collects_declared_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let cancel = CancellationToken::new();

        let mut action = sh_action("produce", "printf artifact > out.bin");
        action.outputs.insert(PathBuf::from("out.bin"));

        let result = sandbox.execute(&action, &cancel).await.unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        let expected = dir.path().join("out.bin");
        assert_eq!(
            result.outputs.get(&expected),
            Some(&Digest::of_bytes(b"artifact"))
        );
    }

    #[tokio::test]
    async fn test_host_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let cancel = CancellationToken::new();

        let result = sandbox
            .execute(&sh_action("fail", "exit 7"), &cancel)
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Failure);
        assert_eq!(result.exit_code, 7);
        assert!(result.outputs.is_empty());
    }
}
