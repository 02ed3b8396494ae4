//! In-process work-stealing worker pool.
//!
//! One Chase-Lev deque per worker (crossbeam): the owner pushes and pops at
//! one end, idle peers steal batches from the other, bounded to half the
//! victim's queue. A dispatcher task feeds the pool from the bounded
//! dispatch channel in priority order (explicit hint, then critical path).
//! Workers execute actions in the sandbox, apply the retry policy to
//! transient outcomes, and push completion events in finish order.

use crate::backoff::RetryPolicy;
use crate::{priority_key, CompletionEvent, DispatchRequest};
use buildflow_core::{Action, ActionStatus, CancellationToken, Error};
use buildflow_sandbox::Sandbox;
use crossbeam_deque::{Injector, Stealer, Worker as Deque};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pool sizing and behavior.
#[derive(Debug, Clone)]
pub struct LocalPoolConfig {
    pub workers: usize,
    /// Bound of the dispatch channel; a full channel backpressures the
    /// scheduler.
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for LocalPoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

struct PoolShared {
    injector: Injector<(Action, u32)>,
    stealers: Vec<Stealer<(Action, u32)>>,
    /// Dispatch channel closed; no further injections will happen.
    closed: AtomicBool,
    /// Actions injected but not yet completed.
    pending: AtomicUsize,
}

/// Handle to a running pool. Dropping the dispatch sender and awaiting
/// [`LocalPool::join`] drains and stops the workers.
pub struct LocalPool {
    dispatch_tx: mpsc::Sender<DispatchRequest>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl LocalPool {
    /// Start the pool. Returns the handle and the completion stream.
    pub fn start(
        config: LocalPoolConfig,
        sandbox: Arc<Sandbox>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<CompletionEvent>) {
        let worker_count = config.workers.max(1);
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<DispatchRequest>(config.queue_capacity);
        let (completion_tx, completion_rx) = mpsc::channel::<CompletionEvent>(1024);

        let mut deques = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let deque = Deque::new_lifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            stealers,
            closed: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        });

        let mut tasks = Vec::with_capacity(worker_count + 1);
        tasks.push(tokio::spawn(dispatcher(Arc::clone(&shared), dispatch_rx)));

        for (worker_index, deque) in deques.into_iter().enumerate() {
            tasks.push(tokio::spawn(worker_loop(
                worker_index,
                deque,
                Arc::clone(&shared),
                Arc::clone(&sandbox),
                completion_tx.clone(),
                cancel.clone(),
                config.retry,
            )));
        }

        (Self { dispatch_tx, tasks }, completion_rx)
    }

    /// Sender half of the bounded dispatch channel.
    pub fn dispatcher(&self) -> mpsc::Sender<DispatchRequest> {
        self.dispatch_tx.clone()
    }

    /// Drop the pool's own sender and wait for workers to drain and exit.
    pub async fn join(self) {
        drop(self.dispatch_tx);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Pull requests off the channel, order them by priority, inject.
async fn dispatcher(shared: Arc<PoolShared>, mut rx: mpsc::Receiver<DispatchRequest>) {
    let mut heap: BinaryHeap<(u64, Reverse<u64>, usize)> = BinaryHeap::new();
    let mut stash: Vec<Option<DispatchRequest>> = Vec::new();
    let mut seq = 0u64;

    while let Some(first) = rx.recv().await {
        // Batch everything immediately available so priority ordering has
        // something to order.
        stage(first, &mut heap, &mut stash, &mut seq);
        while let Ok(request) = rx.try_recv() {
            stage(request, &mut heap, &mut stash, &mut seq);
        }

        while let Some((_, _, slot)) = heap.pop() {
            if let Some(request) = stash[slot].take() {
                shared.pending.fetch_add(1, Ordering::SeqCst);
                shared
                    .injector
                    .push((request.action, request.critical_path));
            }
        }
        stash.clear();
    }
    shared.closed.store(true, Ordering::SeqCst);
}

fn stage(
    request: DispatchRequest,
    heap: &mut BinaryHeap<(u64, Reverse<u64>, usize)>,
    stash: &mut Vec<Option<DispatchRequest>>,
    seq: &mut u64,
) {
    let key = priority_key(&request.action, request.critical_path);
    stash.push(Some(request));
    heap.push((key, Reverse(*seq), stash.len() - 1));
    *seq += 1;
}

async fn worker_loop(
    worker_index: usize,
    deque: Deque<(Action, u32)>,
    shared: Arc<PoolShared>,
    sandbox: Arc<Sandbox>,
    completions: mpsc::Sender<CompletionEvent>,
    cancel: CancellationToken,
    retry: RetryPolicy,
) {
    loop {
        let next = find_work(worker_index, &deque, &shared);
        let (action, _) = match next {
            Some(work) => work,
            None => {
                if shared.closed.load(Ordering::SeqCst) && shared.pending.load(Ordering::SeqCst) == 0
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                continue;
            }
        };

        let mut event = execute_with_retry(&sandbox, action, &cancel, retry).await;
        if let Ok(result) = &mut event.result {
            result.metadata.worker_id = format!("local-{worker_index}");
        }
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        if completions.send(event).await.is_err() {
            // Scheduler went away; nothing left to report to.
            break;
        }
    }
}

/// Local pop first, then the global injector, then peers (bounded batch from
/// the opposite end of the victim's deque).
fn find_work(
    worker_index: usize,
    deque: &Deque<(Action, u32)>,
    shared: &PoolShared,
) -> Option<(Action, u32)> {
    if let Some(work) = deque.pop() {
        return Some(work);
    }

    loop {
        match shared.injector.steal_batch_and_pop(deque) {
            crossbeam_deque::Steal::Success(work) => return Some(work),
            crossbeam_deque::Steal::Empty => break,
            crossbeam_deque::Steal::Retry => continue,
        }
    }

    for (victim, stealer) in shared.stealers.iter().enumerate() {
        if victim == worker_index {
            continue;
        }
        let limit = (stealer.len() / 2).max(1);
        loop {
            match stealer.steal_batch_with_limit_and_pop(deque, limit) {
                crossbeam_deque::Steal::Success(work) => return Some(work),
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }
    }
    None
}

/// Run one action, retrying transient outcomes per policy. A cancelled
/// session short-circuits queued work without spawning it.
async fn execute_with_retry(
    sandbox: &Sandbox,
    action: Action,
    cancel: &CancellationToken,
    retry: RetryPolicy,
) -> CompletionEvent {
    if cancel.is_cancelled() {
        let result = cancelled_result();
        return CompletionEvent {
            action,
            result: Ok(result),
        };
    }

    let mut attempt = 0u32;
    loop {
        let outcome = sandbox.execute(&action, cancel).await;
        match outcome {
            Ok(result) => {
                if RetryPolicy::status_retryable(result.status)
                    && attempt < retry.max_attempts
                    && !cancel.is_cancelled()
                {
                    tracing::warn!(
                        target_id = %action.id.target,
                        attempt,
                        "action timed out; retrying"
                    );
                    tokio::time::sleep(retry.delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                if result.is_success() {
                    if let Some(missing) = missing_declared_output(sandbox, &action, &result) {
                        return CompletionEvent {
                            result: Err(Error::MissingDeclaredOutput {
                                target: action.id.target.clone(),
                                path: missing,
                            }),
                            action,
                        };
                    }
                }
                return CompletionEvent {
                    action,
                    result: Ok(result),
                };
            }
            Err(err) => {
                if retry.should_retry(&err, attempt) && !cancel.is_cancelled() {
                    tracing::warn!(
                        target_id = %action.id.target,
                        attempt,
                        error = %err,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(retry.delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return CompletionEvent {
                    action,
                    result: Err(err),
                };
            }
        }
    }
}

/// A declared output the successful result did not produce, if any.
fn missing_declared_output(
    sandbox: &Sandbox,
    action: &Action,
    result: &buildflow_core::ActionResult,
) -> Option<PathBuf> {
    for declared in &action.outputs {
        let resolved = if declared.is_absolute() {
            declared.clone()
        } else {
            sandbox.workspace_root().join(declared)
        };
        let produced = result
            .outputs
            .keys()
            .any(|produced| produced == &resolved || produced.starts_with(&resolved));
        if !produced {
            return Some(declared.clone());
        }
    }
    None
}

fn cancelled_result() -> buildflow_core::ActionResult {
    buildflow_core::ActionResult {
        status: ActionStatus::Cancelled,
        exit_code: 130,
        stdout: Vec::new(),
        stderr: Vec::new(),
        outputs: Default::default(),
        usage: Default::default(),
        metadata: Default::default(),
    }
}
