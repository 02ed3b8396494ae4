//! Coordinator + remote workers over real TCP on loopback.

use buildflow_core::{Action, ActionId, ActionKind, ActionStatus, CancellationToken, Digest};
use buildflow_dist::{CoordinatorServer, RemoteWorker, RetryPolicy};
use buildflow_sandbox::{Sandbox, SandboxMode};
use std::sync::Arc;
use std::time::Duration;

fn sh_action(name: &str, script: &str) -> Action {
    Action::new(
        ActionId::new(name, ActionKind::Custom, "", Digest::of_bytes(script.as_bytes())),
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
    )
}

fn host_sandbox(root: &std::path::Path) -> Arc<Sandbox> {
    Arc::new(
        Sandbox::builder()
            .mode(SandboxMode::Host)
            .workspace_root(root)
            .build(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatch_across_two_workers() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let (handle, mut completions) = CoordinatorServer::bind(
        "127.0.0.1:0",
        RetryPolicy::none(),
        Duration::from_secs(10),
        cancel.clone(),
    )
    .await
    .unwrap();
    let addr = handle.local_addr.to_string();

    for worker_index in 0..2 {
        let worker = RemoteWorker::new(host_sandbox(dir.path()))
            .with_id(format!("w{worker_index}"))
            .with_capacity(2)
            .with_heartbeat_interval(Duration::from_millis(30));
        let addr = addr.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(&addr, cancel).await });
    }

    for i in 0..10 {
        handle.submit(sh_action(&format!("t{i}"), &format!("printf {i}")), 0).await;
    }

    let mut succeeded = 0;
    for _ in 0..10 {
        let event = tokio::time::timeout(Duration::from_secs(20), completions.recv())
            .await
            .expect("completion within deadline")
            .expect("channel open");
        let result = event.result.unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        succeeded += 1;
    }
    assert_eq!(succeeded, 10);
    assert_eq!(handle.outstanding(), 0);

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_failure_result_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let (handle, mut completions) = CoordinatorServer::bind(
        "127.0.0.1:0",
        RetryPolicy::none(),
        Duration::from_secs(10),
        cancel.clone(),
    )
    .await
    .unwrap();
    let addr = handle.local_addr.to_string();

    let worker = RemoteWorker::new(host_sandbox(dir.path()))
        .with_id("w0")
        .with_capacity(1)
        .with_heartbeat_interval(Duration::from_millis(30));
    {
        let addr = addr.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(&addr, cancel).await });
    }

    handle.submit(sh_action("boom", "exit 9"), 0).await;

    let event = tokio::time::timeout(Duration::from_secs(20), completions.recv())
        .await
        .unwrap()
        .unwrap();
    let result = event.result.unwrap();
    assert_eq!(result.status, ActionStatus::Failure);
    assert_eq!(result.exit_code, 9);

    cancel.cancel();
}
