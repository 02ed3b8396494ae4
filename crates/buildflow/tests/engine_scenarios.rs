//! End-to-end build sessions: real cache directory, real processes through
//! the host sandbox backend, real worker pool.

use buildflow::{
    BuildConfig, BuildGraph, BuildSession, CommandDriver, Error, FailurePolicy, NodeStatus, Target,
    TargetId, TargetKind,
};
use buildflow_sandbox::{Sandbox, SandboxMode};
use std::path::Path;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.root().join(name), content).unwrap();
    }

    fn read(&self, name: &str) -> String {
        String::from_utf8(std::fs::read(self.root().join(name)).unwrap()).unwrap()
    }

    fn sandbox(&self) -> Sandbox {
        Sandbox::builder()
            .mode(SandboxMode::Host)
            .workspace_root(self.root())
            .build()
    }

    fn config(&self) -> BuildConfig {
        BuildConfig::new(self.root().join(".buildflow")).parallelism(2)
    }

    async fn session(&self, graph: BuildGraph, config: BuildConfig) -> BuildSession {
        BuildSession::new(graph, CommandDriver::new(self.root()), self.sandbox(), config)
            .await
            .unwrap()
    }
}

/// A target running `cmd`, reading `sources`, writing `outputs`.
fn command_target(id: &str, cmd: &str, sources: &[&str], outputs: &str) -> Target {
    let mut target = Target::new(id, TargetKind::Custom)
        .with_config("cmd", cmd)
        .with_config("outputs", outputs);
    target.sources = sources.iter().map(|s| s.to_string()).collect();
    target
}

fn link(graph: &mut BuildGraph, child: &str, parent: &str) {
    graph
        .add_dependency(&TargetId::from(child), &TargetId::from(parent))
        .unwrap();
}

#[tokio::test]
async fn test_empty_graph_is_successful_noop() {
    let ws = Workspace::new();
    let report = ws
        .session(BuildGraph::new(), ws.config())
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.executed, 0);
}

#[tokio::test]
async fn test_single_target_executes_once_on_cold_cache() {
    let ws = Workspace::new();
    let mut graph = BuildGraph::new();
    graph
        .add_target(command_target("solo", "printf made > solo.out", &[], "solo.out"))
        .unwrap();

    let report = ws.session(graph, ws.config()).await.run().await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.executed, 1);
    assert_eq!(ws.read("solo.out"), "made");
}

/// Scenario: linear chain a -> b -> c. Cold cache runs all three in
/// dependency order; the second run executes nothing.
#[tokio::test]
async fn test_linear_chain_and_rebuild_idempotence() {
    let ws = Workspace::new();

    let build_graph = || {
        let mut graph = BuildGraph::new();
        graph
            .add_target(command_target("a", "printf A > a.out", &[], "a.out"))
            .unwrap();
        graph
            .add_target(command_target("b", "cat a.out > b.out; printf B >> b.out", &["a.out"], "b.out"))
            .unwrap();
        graph
            .add_target(command_target("c", "cat b.out > c.out; printf C >> c.out", &["b.out"], "c.out"))
            .unwrap();
        link(&mut graph, "b", "a");
        link(&mut graph, "c", "b");
        graph
    };

    // Deterministic topological order.
    let graph = build_graph();
    let order: Vec<String> = graph
        .topological_sort()
        .into_iter()
        .map(|idx| graph.target_id(idx).to_string())
        .collect();
    assert_eq!(order, ["a", "b", "c"]);

    let report = ws.session(graph, ws.config()).await.run().await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.executed, 3);
    assert_eq!(ws.read("c.out"), "ABC");

    // Unchanged workspace: zero executed actions, everything cached.
    let report = ws
        .session(build_graph(), ws.config())
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(report.executed, 0);
    assert_eq!(report.cached, 3);
    for id in ["a", "b", "c"] {
        assert_eq!(
            report.status(&TargetId::from(id)),
            Some(NodeStatus::Cached),
            "{id}"
        );
    }
    assert_eq!(ws.read("c.out"), "ABC");
}

/// Scenario: diamond r -> {l1, l2} -> app with parallelism 2. Exactly four
/// actions on a cold cache, all successful.
#[tokio::test]
async fn test_diamond_builds_all_four() {
    let ws = Workspace::new();
    let mut graph = BuildGraph::new();
    graph
        .add_target(command_target("r", "printf R > r.out", &[], "r.out"))
        .unwrap();
    graph
        .add_target(command_target("l1", "cat r.out > l1.out", &["r.out"], "l1.out"))
        .unwrap();
    graph
        .add_target(command_target("l2", "cat r.out > l2.out", &["r.out"], "l2.out"))
        .unwrap();
    graph
        .add_target(command_target(
            "app",
            "cat l1.out l2.out > app.out",
            &["l1.out", "l2.out"],
            "app.out",
        ))
        .unwrap();
    link(&mut graph, "l1", "r");
    link(&mut graph, "l2", "r");
    link(&mut graph, "app", "l1");
    link(&mut graph, "app", "l2");

    let report = ws.session(graph, ws.config()).await.run().await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.executed, 4);
    assert_eq!(ws.read("app.out"), "RR");
    for id in ["r", "l1", "l2", "app"] {
        assert_eq!(
            report.status(&TargetId::from(id)),
            Some(NodeStatus::Success),
            "{id}"
        );
    }
}

/// Scenario: diamond under fail-fast where l1 exits 2. l2 finishes before
/// the failure lands; app is skipped; the build exits 1.
#[tokio::test]
async fn test_fail_fast_diamond() {
    let ws = Workspace::new();
    let mut graph = BuildGraph::new();
    graph
        .add_target(command_target("r", "printf R > r.out", &[], "r.out"))
        .unwrap();
    graph
        .add_target(command_target("l1", "sleep 0.4; exit 2", &["r.out"], ""))
        .unwrap();
    graph
        .add_target(command_target("l2", "cat r.out > l2.out", &["r.out"], "l2.out"))
        .unwrap();
    graph
        .add_target(command_target("app", "printf never > app.out", &["l2.out"], "app.out"))
        .unwrap();
    link(&mut graph, "l1", "r");
    link(&mut graph, "l2", "r");
    link(&mut graph, "app", "l1");
    link(&mut graph, "app", "l2");

    let config = ws.config().failure_policy(FailurePolicy::FailFast);
    let report = ws.session(graph, config).await.run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.status(&TargetId::from("r")), Some(NodeStatus::Success));
    assert_eq!(report.status(&TargetId::from("l1")), Some(NodeStatus::Failed));
    assert_eq!(report.status(&TargetId::from("l2")), Some(NodeStatus::Success));
    assert_eq!(report.status(&TargetId::from("app")), Some(NodeStatus::Skipped));
    assert!(!ws.root().join("app.out").exists());
    let rendered = report.first_error.unwrap();
    assert!(rendered.contains("l1"), "{rendered}");
}

/// Keep-going: a failure skips exactly the failed target's dependents;
/// independent subtrees still build.
#[tokio::test]
async fn test_keep_going_contains_failure() {
    let ws = Workspace::new();
    let mut graph = BuildGraph::new();
    graph
        .add_target(command_target("broken", "exit 1", &[], ""))
        .unwrap();
    graph
        .add_target(command_target("dependent", "printf x > dep.out", &[], "dep.out"))
        .unwrap();
    graph
        .add_target(command_target("island", "printf ok > island.out", &[], "island.out"))
        .unwrap();
    link(&mut graph, "dependent", "broken");

    let config = ws.config().failure_policy(FailurePolicy::KeepGoing);
    let report = ws.session(graph, config).await.run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.status(&TargetId::from("broken")),
        Some(NodeStatus::Failed)
    );
    assert_eq!(
        report.status(&TargetId::from("dependent")),
        Some(NodeStatus::Skipped)
    );
    assert_eq!(
        report.status(&TargetId::from("island")),
        Some(NodeStatus::Success)
    );
    assert_eq!(ws.read("island.out"), "ok");
}

/// Scenario: closing a cycle is rejected with the offending path and leaves
/// the graph unchanged.
#[test]
fn test_cycle_rejected_with_path() {
    let mut graph = BuildGraph::new();
    graph
        .add_target(command_target("a", "true", &[], ""))
        .unwrap();
    graph
        .add_target(command_target("b", "true", &[], ""))
        .unwrap();
    link(&mut graph, "b", "a");

    let err = graph
        .add_dependency(&TargetId::from("a"), &TargetId::from("b"))
        .unwrap_err();
    match &err {
        Error::CycleDetected { path } => {
            let names: Vec<&str> = path.iter().map(TargetId::as_str).collect();
            assert_eq!(names, ["b", "a", "b"]);
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 2);
    assert_eq!(graph.topological_sort().len(), 2);
}

/// Scenario: changing a source invalidates the cache entry; the action
/// re-executes and the new result is stored.
#[tokio::test]
async fn test_cache_invalidation_on_input_change() {
    let ws = Workspace::new();
    ws.write("s.txt", "X");

    let build_graph = || {
        let mut graph = BuildGraph::new();
        graph
            .add_target(command_target(
                "t",
                "cat s.txt > t.out",
                &["s.txt"],
                "t.out",
            ))
            .unwrap();
        graph
    };

    let report = ws
        .session(build_graph(), ws.config())
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(ws.read("t.out"), "X");

    // Unchanged: a hit.
    let report = ws
        .session(build_graph(), ws.config())
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(report.executed, 0);
    assert_eq!(report.cached, 1);

    // Changed input: a miss, a re-execution, a fresh entry.
    ws.write("s.txt", "Y");
    let report = ws
        .session(build_graph(), ws.config())
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(ws.read("t.out"), "Y");

    // And the fresh entry hits again.
    let report = ws
        .session(build_graph(), ws.config())
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(report.cached, 1);
    assert_eq!(report.executed, 0);
}

/// A missing declared output is an action failure, never retried.
#[tokio::test]
async fn test_missing_declared_output_fails_target() {
    let ws = Workspace::new();
    let mut graph = BuildGraph::new();
    graph
        .add_target(command_target("liar", "true", &[], "promised.out"))
        .unwrap();

    let report = ws.session(graph, ws.config()).await.run().await.unwrap();
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.status(&TargetId::from("liar")),
        Some(NodeStatus::Failed)
    );
    let rendered = report.first_error.unwrap();
    assert!(rendered.contains("promised.out"), "{rendered}");
}

/// Timeouts surface as failed targets with the timeout context.
#[tokio::test]
async fn test_wall_timeout_fails_target() {
    let ws = Workspace::new();
    let mut graph = BuildGraph::new();
    let target = command_target("slow", "sleep 30", &[], "")
        .with_config("timeout_ms", "150");
    graph.add_target(target).unwrap();

    let mut config = ws.config();
    config.retry = buildflow_dist::RetryPolicy::none();
    let report = ws.session(graph, config).await.run().await.unwrap();
    assert_eq!(report.exit_code(), 1);
    let rendered = report.first_error.unwrap();
    assert!(rendered.contains("timed out"), "{rendered}");
}
