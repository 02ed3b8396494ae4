//! The hermetic backend.
//!
//! Builds a per-action execution root under a randomized temp directory:
//! declared inputs are copied in read-only, declared outputs and temps are
//! writable, everything else is simply not there. The action runs with the
//! execution root as its working directory, a scrubbed environment, hard
//! rlimits, and (platform permitting) network/user namespace isolation. On
//! success the declared outputs are copied back to the workspace.
//!
//! Hermetic execution requires workspace-relative declared paths: an
//! absolute path cannot be relocated into the execution root without
//! breaking the argv that references it.

use crate::exec::{self, ExitKind, ProcessSpec};
use crate::host::collect_files;
use crate::Sandbox;
use buildflow_core::{Action, ActionResult, CancellationToken, Digest, Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub(crate) async fn execute(
    sandbox: &Sandbox,
    action: &Action,
    cancel: &CancellationToken,
) -> Result<ActionResult> {
    reject_absolute_paths(action)?;

    let exec_root = tempfile::Builder::new()
        .prefix("buildflow-action-")
        .tempdir()
        .map_err(Error::Io)?;
    let root = exec_root.path().to_path_buf();

    materialize_inputs(sandbox.workspace_root(), &root, action)?;
    prepare_writable_paths(&root, action)?;
    let tmp = root.join(".tmp");
    std::fs::create_dir_all(&tmp)?;

    let spec = ProcessSpec {
        argv: action.argv.clone(),
        cwd: root.clone(),
        env: ProcessSpec::scrubbed_env(action, &tmp),
        limits: action.limits,
        network_hermetic: action.network_hermetic,
        drop_privileges: sandbox.drop_privileges_requested(),
    };

    let outcome = exec::run_process(spec, cancel, sandbox.grace()).await?;

    let mut outputs = BTreeMap::new();
    if matches!(outcome.kind, ExitKind::Exited(0)) {
        outputs = harvest_outputs(sandbox.workspace_root(), &root, action)?;
    }

    if sandbox.keep_diagnostics() {
        let kept = exec_root.keep();
        tracing::info!(exec_root = %kept.display(), "retaining sandbox execution root");
    }
    // Otherwise the TempDir guard removes the tree here, on every path.

    Ok(exec::assemble_result(outcome, outputs))
}

fn reject_absolute_paths(action: &Action) -> Result<()> {
    let offender = action
        .inputs
        .iter()
        .chain(&action.outputs)
        .chain(&action.temps)
        .find(|p| p.is_absolute());
    match offender {
        Some(path) => Err(Error::Config(format!(
            "hermetic sandbox requires workspace-relative paths; {} is absolute",
            path.display()
        ))),
        None => Ok(()),
    }
}

/// Copy declared inputs into the execution root and mark them read-only.
fn materialize_inputs(workspace: &Path, root: &Path, action: &Action) -> Result<()> {
    for declared in &action.inputs {
        let src = workspace.join(declared);
        if !src.exists() {
            return Err(Error::MissingInput {
                target: action.id.target.clone(),
                path: declared.clone(),
            });
        }
        if src.is_file() {
            copy_readonly(&src, &root.join(declared))?;
        } else {
            for entry in walkdir::WalkDir::new(&src)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let rel = entry
                    .path()
                    .strip_prefix(workspace)
                    .map_err(|_| Error::Config("input escapes workspace".to_string()))?;
                copy_readonly(entry.path(), &root.join(rel))?;
            }
        }
    }
    Ok(())
}

fn copy_readonly(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    let mut perms = std::fs::metadata(dst)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(dst, perms)?;
    Ok(())
}

/// Pre-create parents for declared outputs and the declared temp dirs.
fn prepare_writable_paths(root: &Path, action: &Action) -> Result<()> {
    for output in &action.outputs {
        let staged = root.join(output);
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    for temp in &action.temps {
        std::fs::create_dir_all(root.join(temp))?;
    }
    Ok(())
}

/// Copy produced outputs back to the workspace; keys in the returned map are
/// workspace-absolute paths.
fn harvest_outputs(
    workspace: &Path,
    root: &Path,
    action: &Action,
) -> Result<BTreeMap<PathBuf, Digest>> {
    let mut outputs = BTreeMap::new();
    for declared in &action.outputs {
        let produced_at = root.join(declared);
        for (path, digest) in collect_files(&produced_at)? {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| Error::InvariantViolation("output escapes exec root".to_string()))?;
            let dest = workspace.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&path, &dest)?;
            outputs.insert(dest, digest);
        }
    }
    Ok(outputs)
}
