//! The language-driver contract.
//!
//! The engine never knows how to compile anything; an [`ActionProducer`]
//! turns a ready target into an action descriptor, and may discover new
//! targets from a finished result (generated code, test shards). Language
//! drivers live outside the kernel; [`CommandDriver`] is the concrete
//! variant used by tests and custom targets - it runs the target's declared
//! command line as-is.

use buildflow_core::{
    Action, ActionId, ActionKind, ActionResult, Error, Result, Target, TargetKind,
};
use std::path::{Path, PathBuf};

/// Capability interface between the engine and language drivers.
#[async_trait::async_trait]
pub trait ActionProducer: Send + Sync {
    /// Compose the action for a ready target, including its fingerprint
    /// (which requires hashing the declared inputs).
    async fn produces_action(&self, target: &Target) -> Result<Action>;

    /// Targets discovered from a finished action (codegen outputs, test
    /// shards). Defaults to none.
    fn discovers_outputs(&self, _result: &ActionResult) -> Vec<Target> {
        Vec::new()
    }
}

/// Runs each target's configured command line.
///
/// Config keys understood:
/// - `cmd` - shell command (required)
/// - `outputs` - whitespace-separated declared output paths
/// - `timeout_ms` - wall deadline override (0 disables)
///
/// Sources become declared inputs. Paths resolve against the workspace root
/// into absolute paths, which pairs with the host sandbox backend.
pub struct CommandDriver {
    workspace_root: PathBuf,
}

impl CommandDriver {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    fn resolve(&self, declared: &str) -> PathBuf {
        let path = Path::new(declared);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

#[async_trait::async_trait]
impl ActionProducer for CommandDriver {
    async fn produces_action(&self, target: &Target) -> Result<Action> {
        let cmd = target
            .config
            .get("cmd")
            .ok_or_else(|| Error::Config(format!("target {} declares no cmd", target.id)))?;

        let kind = match target.kind {
            TargetKind::Test => ActionKind::Test,
            _ => ActionKind::Custom,
        };

        let mut action = Action::new(
            ActionId::new(
                target.id.clone(),
                kind,
                "",
                buildflow_core::Digest::of_bytes(&[]),
            ),
            vec!["sh".to_string(), "-c".to_string(), cmd.clone()],
        );

        for source in &target.sources {
            action.inputs.insert(self.resolve(source));
        }
        if let Some(outputs) = target.config.get("outputs") {
            for output in outputs.split_whitespace() {
                action.outputs.insert(self.resolve(output));
            }
        }
        if let Some(timeout) = target.config.get("timeout_ms") {
            action.limits.wall_timeout_ms = timeout
                .parse()
                .map_err(|_| Error::Config(format!("bad timeout_ms on target {}", target.id)))?;
        }

        // The fingerprint closes over the actual input contents.
        action.id.input_digest = buildflow_cache::store::compute_input_digest(&action).await?;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildflow_core::TargetId;

    fn target_with_cmd(id: &str, cmd: &str) -> Target {
        Target::new(id, TargetKind::Custom).with_config("cmd", cmd)
    }

    #[tokio::test]
    async fn test_produces_action_shape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"data").unwrap();

        let driver = CommandDriver::new(dir.path());
        let mut target = target_with_cmd("t", "cp in.txt out.txt").with_config("outputs", "out.txt");
        target.sources.push("in.txt".to_string());

        let action = driver.produces_action(&target).await.unwrap();
        assert_eq!(action.argv[0], "sh");
        assert!(action.inputs.contains(&dir.path().join("in.txt")));
        assert!(action.outputs.contains(&dir.path().join("out.txt")));
        assert_eq!(action.id.target, TargetId::from("t"));
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_input_content() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, b"v1").unwrap();

        let driver = CommandDriver::new(dir.path());
        let mut target = target_with_cmd("t", "true");
        target.sources.push("in.txt".to_string());

        let before = driver.produces_action(&target).await.unwrap().fingerprint();
        std::fs::write(&input, b"v2").unwrap();
        let after = driver.produces_action(&target).await.unwrap().fingerprint();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_missing_cmd_is_config_error() {
        let driver = CommandDriver::new("/tmp");
        let target = Target::new("bare", TargetKind::Custom);
        let err = driver.produces_action(&target).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_source_is_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let driver = CommandDriver::new(dir.path());
        let mut target = target_with_cmd("t", "true");
        target.sources.push("ghost.txt".to_string());

        let err = driver.produces_action(&target).await.unwrap_err();
        assert!(matches!(err, Error::MissingInput { .. }));
    }
}
