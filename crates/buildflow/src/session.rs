//! The build session: a single-threaded cooperative event loop driving the
//! graph from pending to finished.
//!
//! Each iteration: drain completion events (applied in arrival order),
//! promote newly-ready nodes, compose their actions through the driver,
//! consult the action cache (a hit marks the node `Cached` and restores its
//! outputs from the CAS), and dispatch misses to the worker pool through a
//! bounded channel - a full
//! channel defers emission, propagating backpressure upward. The session
//! terminates when the ready set and the in-flight set are both empty, or,
//! under fail-fast, after draining once a failure is observed.
//!
//! The per-fingerprint in-flight registry is consulted before every
//! dispatch, so two nodes (or two concurrent sessions sharing the cache
//! object) never execute the same fingerprint at once.

use crate::config::{workspace_secret, BuildConfig};
use crate::driver::ActionProducer;
use crate::report::BuildReport;
use buildflow_cache::{InflightClaim, LocalCache, RemoteCache};
use buildflow_core::{ActionStatus, CancellationToken, Digest, Error, Result, Target};
use buildflow_dist::{CompletionEvent, DispatchRequest, LocalPool, LocalPoolConfig};
use buildflow_graph::{critical_path_lengths, BuildGraph, FailurePolicy, NodeIndex, NodeStatus};
use buildflow_sandbox::Sandbox;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// One build over one graph. Constructed at session start, consumed by
/// [`BuildSession::run`], discarded at session end.
pub struct BuildSession {
    graph: BuildGraph,
    driver: Box<dyn ActionProducer>,
    cache: Arc<LocalCache>,
    sandbox: Arc<Sandbox>,
    config: BuildConfig,
    cancel: CancellationToken,
}

impl BuildSession {
    /// Open the cache (creating the workspace secret on first use) and bind
    /// the session together.
    pub async fn new(
        graph: BuildGraph,
        driver: impl ActionProducer + 'static,
        sandbox: Sandbox,
        config: BuildConfig,
    ) -> Result<Self> {
        let secret = workspace_secret(&config.cache_root)?;
        let mut cache =
            LocalCache::open(config.cache_root.clone(), secret, config.cache_limits).await?;
        if let Some(remote_config) = config.remote_cache.clone() {
            cache = cache.with_remote(RemoteCache::new(remote_config)?);
        }
        Ok(Self {
            graph,
            driver: Box::new(driver),
            cache: Arc::new(cache),
            sandbox: Arc::new(sandbox),
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Token cancelling the whole session; checked at every suspension
    /// point downstream.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// Drive the graph to completion.
    pub async fn run(mut self) -> Result<BuildReport> {
        let started = Instant::now();
        let mut report = BuildReport::default();

        if self.graph.is_empty() {
            report.wall_time = started.elapsed();
            return Ok(report);
        }

        let mut critical = critical_path_lengths(&self.graph);
        let (pool, mut completions) = LocalPool::start(
            LocalPoolConfig {
                workers: self.config.parallelism,
                queue_capacity: (self.config.parallelism * 4).max(32),
                retry: self.config.retry,
            },
            Arc::clone(&self.sandbox),
            self.cancel.clone(),
        );
        let dispatch = pool.dispatcher();

        // Scheduler-private state for the session.
        let mut in_flight: HashMap<Digest, NodeIndex> = HashMap::new();
        let mut guards: HashMap<Digest, buildflow_cache::inflight::InflightGuard> = HashMap::new();
        let mut pending: VecDeque<DispatchRequest> = VecDeque::new();
        let mut halted = false;

        loop {
            // Promote ready nodes; under fail-fast-after-failure no new work
            // is considered.
            if !halted {
                for idx in self.graph.ready_nodes() {
                    self.schedule_node(
                        idx,
                        &critical,
                        &mut in_flight,
                        &mut guards,
                        &mut pending,
                        &mut report,
                        &mut halted,
                    )
                    .await?;
                    if halted {
                        break;
                    }
                }
            }

            // Flush deferred dispatches while the bounded channel has room.
            while let Some(request) = pending.pop_front() {
                match dispatch.try_send(request) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(request)) => {
                        pending.push_front(request);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return Err(Error::InvariantViolation(
                            "worker pool terminated while the session was live".to_string(),
                        ));
                    }
                }
            }

            if in_flight.is_empty() && pending.is_empty() {
                if halted || self.graph.ready_nodes().is_empty() {
                    break;
                }
                // New ready nodes appeared from the marks above; loop.
                continue;
            }

            // Wait for one completion and apply it. Completion events are
            // applied strictly in arrival order.
            let event = completions.recv().await.ok_or_else(|| {
                Error::InvariantViolation("completion channel closed mid-session".to_string())
            })?;
            self.apply_completion(
                event,
                &mut in_flight,
                &mut guards,
                &mut report,
                &mut halted,
                &mut critical,
            )
            .await?;
        }

        drop(dispatch);
        pool.join().await;

        // Reclaim space when this session pushed the cache past its bounds.
        if self.cache.over_limits().await {
            if let Err(err) = self.cache.evict().await {
                tracing::warn!(error = %err, "cache eviction failed");
            }
        }

        // Final tally from the graph itself.
        for idx in self.graph.node_indices().collect::<Vec<_>>() {
            let node = self.graph.node(idx);
            report.statuses.insert(node.target.id.clone(), node.status);
            match node.status {
                NodeStatus::Cached => report.cached += 1,
                NodeStatus::Failed => report.failed += 1,
                NodeStatus::Skipped => report.skipped += 1,
                _ => {}
            }
        }
        report.wall_time = started.elapsed();
        tracing::info!(
            executed = report.executed,
            cached = report.cached,
            failed = report.failed,
            skipped = report.skipped,
            wall_ms = report.wall_time.as_millis() as u64,
            "build session finished"
        );
        Ok(report)
    }

    /// Move one ready node toward execution: compose its action, try the
    /// cache, otherwise queue a dispatch.
    #[allow(clippy::too_many_arguments)]
    async fn schedule_node(
        &mut self,
        idx: NodeIndex,
        critical: &HashMap<NodeIndex, u32>,
        in_flight: &mut HashMap<Digest, NodeIndex>,
        guards: &mut HashMap<Digest, buildflow_cache::inflight::InflightGuard>,
        pending: &mut VecDeque<DispatchRequest>,
        report: &mut BuildReport,
        halted: &mut bool,
    ) -> Result<()> {
        self.graph.mark(idx, NodeStatus::Ready)?;
        let target = self.graph.node(idx).target.clone();

        let action = match self.driver.produces_action(&target).await {
            Ok(action) => action,
            Err(err) => {
                // The node cannot run; it fails like an action would.
                tracing::error!(target_id = %target.id, error = %err, "driver failed to compose action");
                report.note_error(&err);
                self.graph.mark(idx, NodeStatus::Running)?;
                self.fail_node(idx, halted)?;
                return Ok(());
            }
        };
        self.graph.mark(idx, NodeStatus::Running)?;

        let fingerprint = action.fingerprint();
        loop {
            match self.cache.inflight().claim(fingerprint).await {
                InflightClaim::Leader(guard) => {
                    match self.cache.lookup(&action, &target.config).await {
                        Ok(Some(result)) => {
                            drop(guard);
                            self.graph.mark(idx, NodeStatus::Cached)?;
                            self.adopt_discovered(&result)?;
                            tracing::debug!(target_id = %target.id, "target satisfied from cache");
                        }
                        other => {
                            if let Err(err) = other {
                                tracing::warn!(target_id = %target.id, error = %err, "cache lookup failed; executing");
                            }
                            guards.insert(fingerprint, guard);
                            in_flight.insert(fingerprint, idx);
                            report.executed += 1;
                            pending.push_back(DispatchRequest {
                                critical_path: critical.get(&idx).copied().unwrap_or(0),
                                action,
                            });
                        }
                    }
                    return Ok(());
                }
                InflightClaim::Waited => {
                    // Another execution of this fingerprint just finished;
                    // its entry should now be in the cache.
                    if let Ok(Some(result)) = self.cache.lookup(&action, &target.config).await {
                        self.graph.mark(idx, NodeStatus::Cached)?;
                        self.adopt_discovered(&result)?;
                        return Ok(());
                    }
                    // The leader failed or could not store; contend again.
                }
            }
        }
    }

    /// Apply one completion event to the graph.
    async fn apply_completion(
        &mut self,
        event: CompletionEvent,
        in_flight: &mut HashMap<Digest, NodeIndex>,
        guards: &mut HashMap<Digest, buildflow_cache::inflight::InflightGuard>,
        report: &mut BuildReport,
        halted: &mut bool,
        critical: &mut HashMap<NodeIndex, u32>,
    ) -> Result<()> {
        let fingerprint = event.action.fingerprint();
        let Some(idx) = in_flight.remove(&fingerprint) else {
            tracing::warn!(%fingerprint, "completion for unknown dispatch");
            return Ok(());
        };
        let target = self.graph.node(idx).target.clone();

        match event.result {
            Ok(result) if result.status == ActionStatus::Success => {
                let metadata = target.config.clone();
                if let Err(err) = self.cache.store(&event.action, &metadata, &result).await {
                    tracing::warn!(target_id = %target.id, error = %err, "cache store failed; result still applied");
                }
                guards.remove(&fingerprint);
                self.graph.mark(idx, NodeStatus::Success)?;
                if self.adopt_discovered(&result)? {
                    *critical = critical_path_lengths(&self.graph);
                }
            }
            Ok(result) => {
                guards.remove(&fingerprint);
                let err = match result.status {
                    ActionStatus::Timeout => Error::Timeout {
                        target: target.id.clone(),
                        wall_ms: event.action.limits.wall_timeout_ms,
                    },
                    _ => Error::ActionFailed {
                        target: target.id.clone(),
                        exit_code: result.exit_code,
                    },
                };
                tracing::error!(
                    target_id = %target.id,
                    status = ?result.status,
                    exit_code = result.exit_code,
                    stderr = %String::from_utf8_lossy(&result.stderr),
                    "action failed"
                );
                report.note_error(&err);
                self.fail_node(idx, halted)?;
            }
            Err(err) => {
                guards.remove(&fingerprint);
                tracing::error!(target_id = %target.id, error = %err, "action errored");
                report.note_error(&err);
                self.fail_node(idx, halted)?;
            }
        }
        Ok(())
    }

    /// Mark a node failed, propagate skips, and trigger fail-fast.
    fn fail_node(&mut self, idx: NodeIndex, halted: &mut bool) -> Result<()> {
        self.graph.mark(idx, NodeStatus::Failed)?;
        let skipped = self.graph.failure_propagation(idx)?;
        if !skipped.is_empty() {
            tracing::debug!(count = skipped.len(), "skipped transitive dependents");
        }
        if self.config.failure_policy == FailurePolicy::FailFast {
            *halted = true;
            self.cancel.cancel();
        }
        Ok(())
    }

    /// Fold driver-discovered targets into the graph mid-session. Returns
    /// whether anything was added (the critical-path map is then stale).
    fn adopt_discovered(&mut self, result: &buildflow_core::ActionResult) -> Result<bool> {
        let discovered: Vec<Target> = self.driver.discovers_outputs(result);
        let mut added = false;
        for target in discovered {
            if self.graph.contains(&target.id) {
                continue;
            }
            let deps = target.deps.clone();
            let id = target.id.clone();
            self.graph.add_target(target)?;
            for dep in deps {
                self.graph.add_dependency(&id, &dep)?;
            }
            added = true;
        }
        Ok(added)
    }
}
