//! TCP coordinator: accepts worker connections, dispatches queued actions,
//! relays steals, reaps dead workers, and applies the retry policy.
//!
//! One task per connection reads frames; a paired task owns the write half
//! and drains a per-worker outbound channel, so any part of the coordinator
//! can message any worker without holding socket locks across awaits.

use crate::autoscaler::{Autoscaler, AutoscalerConfig};
use crate::backoff::RetryPolicy;
use crate::protocol::{
    self, ActionRequest, Message, PeerAnnounce, Shutdown, StealRequest,
};
use crate::registry::WorkerRegistry;
use crate::{priority_key, CompletionEvent};
use buildflow_core::{Action, CancellationToken, Digest, Error, Result};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Queued, not-yet-assigned work.
struct QueueItem {
    key: u64,
    seq: Reverse<u64>,
    action: Action,
    critical_path: u32,
    attempt: u32,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}
impl Eq for QueueItem {}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key, self.seq).cmp(&(other.key, other.seq))
    }
}

/// Work currently assigned to a worker.
struct Outstanding {
    action: Action,
    critical_path: u32,
    attempt: u32,
    worker_id: String,
}

struct CoordState {
    registry: Arc<WorkerRegistry>,
    queue: Mutex<BinaryHeap<QueueItem>>,
    seq: Mutex<u64>,
    outstanding: Mutex<HashMap<Digest, Outstanding>>,
    /// Capacity workers asked for and have not yet been served.
    hungry: Mutex<HashMap<String, u32>>,
    writers: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    completions: mpsc::Sender<CompletionEvent>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    /// Desired worker count published by the autoscaler; external
    /// provisioners poll it via [`CoordinatorHandle::desired_workers`].
    desired_workers: AtomicU32,
}

/// The dispatch-layer server.
pub struct CoordinatorServer;

impl CoordinatorServer {
    /// Bind and start serving. Returns the submission handle and the
    /// completion stream.
    pub async fn bind(
        addr: &str,
        retry: RetryPolicy,
        silence_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(CoordinatorHandle, mpsc::Receiver<CompletionEvent>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("local addr: {e}")))?;

        let (completion_tx, completion_rx) = mpsc::channel(1024);
        let registry = Arc::new(WorkerRegistry::new(silence_interval));
        let state = Arc::new(CoordState {
            registry: Arc::clone(&registry),
            queue: Mutex::new(BinaryHeap::new()),
            seq: Mutex::new(0),
            outstanding: Mutex::new(HashMap::new()),
            hungry: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            completions: completion_tx,
            retry,
            cancel: cancel.clone(),
            desired_workers: AtomicU32::new(1),
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        tokio::spawn(liveness_loop(Arc::clone(&state), silence_interval));
        tokio::spawn(autoscaler_loop(
            Arc::clone(&state),
            AutoscalerConfig::default(),
        ));
        tokio::spawn(cancel_broadcast(Arc::clone(&state)));

        Ok((
            CoordinatorHandle {
                local_addr,
                state,
            },
            completion_rx,
        ))
    }
}

/// Submission and introspection handle held by the scheduler.
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub local_addr: SocketAddr,
    state: Arc<CoordState>,
}

impl CoordinatorHandle {
    /// Queue one action for dispatch.
    pub async fn submit(&self, action: Action, critical_path: u32) {
        enqueue(&self.state, action, critical_path, 0);
        serve_hungry(&self.state).await;
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn queue_depth(&self) -> usize {
        self.state.queue.lock().len()
    }

    pub fn outstanding(&self) -> usize {
        self.state.outstanding.lock().len()
    }

    /// Worker count the autoscaler currently wants; provisioning toward it
    /// is the deployment's concern.
    pub fn desired_workers(&self) -> u32 {
        self.state.desired_workers.load(Ordering::Relaxed)
    }

    /// Ask every connected worker to drain and disconnect.
    pub async fn shutdown(&self, reason: &str) {
        let writers: Vec<mpsc::Sender<Message>> =
            self.state.writers.lock().values().cloned().collect();
        for writer in writers {
            let _ = writer
                .send(Message::Shutdown(Shutdown {
                    reason: reason.to_string(),
                }))
                .await;
        }
    }
}

fn enqueue(state: &Arc<CoordState>, action: Action, critical_path: u32, attempt: u32) {
    let key = priority_key(&action, critical_path);
    let mut seq = state.seq.lock();
    let item = QueueItem {
        key,
        seq: Reverse(*seq),
        action,
        critical_path,
        attempt,
    };
    *seq += 1;
    drop(seq);
    state.queue.lock().push(item);
}

/// Hand queued actions to workers with unserved WorkRequests.
async fn serve_hungry(state: &Arc<CoordState>) {
    loop {
        // Pick one hungry worker with remaining appetite.
        let candidate = {
            let hungry = state.hungry.lock();
            hungry
                .iter()
                .find(|(_, capacity)| **capacity > 0)
                .map(|(id, _)| id.clone())
        };
        let worker_id = match candidate {
            Some(id) => id,
            None => return,
        };
        let item = match state.queue.lock().pop() {
            Some(item) => item,
            None => return,
        };
        if !send_action(state, &worker_id, item).await {
            continue;
        }
        if let Some(capacity) = state.hungry.lock().get_mut(&worker_id) {
            *capacity = capacity.saturating_sub(1);
        }
    }
}

/// Assign and transmit one queue item; re-queues it when the worker's
/// connection is gone. Returns whether the send succeeded.
async fn send_action(state: &Arc<CoordState>, worker_id: &str, item: QueueItem) -> bool {
    let writer = state.writers.lock().get(worker_id).cloned();
    let writer = match writer {
        Some(writer) => writer,
        None => {
            state.hungry.lock().remove(worker_id);
            let QueueItem {
                action,
                critical_path,
                attempt,
                ..
            } = item;
            enqueue(state, action, critical_path, attempt);
            return false;
        }
    };

    let fingerprint = item.action.fingerprint();
    state.outstanding.lock().insert(
        fingerprint,
        Outstanding {
            action: item.action.clone(),
            critical_path: item.critical_path,
            attempt: item.attempt,
            worker_id: worker_id.to_string(),
        },
    );
    state.registry.assign(worker_id, fingerprint);

    let message = Message::ActionRequest(ActionRequest {
        action: item.action,
        attempt: item.attempt,
    });
    if writer.send(message).await.is_err() {
        // Connection task is gone; undo and re-queue.
        state.registry.complete(worker_id, &fingerprint);
        if let Some(orphan) = state.outstanding.lock().remove(&fingerprint) {
            enqueue(state, orphan.action, orphan.critical_path, orphan.attempt);
        }
        return false;
    }
    true
}

async fn accept_loop(listener: TcpListener, state: Arc<CoordState>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "worker connection accepted");
                        tokio::spawn(connection_loop(socket, Arc::clone(&state)));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            () = state.cancel.cancelled() => return,
        }
    }
}

async fn connection_loop(socket: TcpStream, state: Arc<CoordState>) {
    let (mut reader, mut writer) = socket.into_split();

    // The opening frame must be a valid Registration.
    let registration = match protocol::read_message(&mut reader).await {
        Ok(Some(Message::Registration(reg))) => reg,
        Ok(_) => {
            tracing::warn!("connection did not open with Registration; dropping");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed reading registration");
            return;
        }
    };
    if let Err(e) = protocol::validate_registration(&registration) {
        tracing::warn!(error = %e, "rejecting incompatible worker");
        return;
    }

    let worker_id = registration.worker_id.clone();
    state.registry.register(
        worker_id.clone(),
        registration.capabilities.clone(),
        registration.capacity,
    );

    // Outbound half: a channel drained into the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
    state
        .writers
        .lock()
        .insert(worker_id.clone(), outbound_tx.clone());
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if protocol::write_message(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    // Tell the rest of the pool about the newcomer.
    broadcast_peer(&state, &worker_id).await;

    while let Ok(Some(message)) = protocol::read_message(&mut reader).await {
        match message {
            Message::HeartBeat(hb) => {
                state.registry.heartbeat(&hb.worker_id, hb.load, hb.queue_depth);
            }
            Message::WorkRequest(req) => {
                state.hungry.lock().insert(req.worker_id.clone(), req.capacity);
                serve_hungry(&state).await;
                maybe_relay_steal(&state, &req.worker_id).await;
            }
            Message::ActionResult(report) => {
                handle_report(&state, report).await;
                serve_hungry(&state).await;
            }
            Message::StealResponse(response) => {
                for action in response.actions {
                    // Stolen work returns to the queue and flows to whoever
                    // is hungry.
                    if let Some(orphan) =
                        state.outstanding.lock().remove(&action.fingerprint())
                    {
                        state.registry.complete(&orphan.worker_id, &action.fingerprint());
                        enqueue(&state, orphan.action, orphan.critical_path, orphan.attempt);
                    } else {
                        enqueue(&state, action, 0, 0);
                    }
                }
                serve_hungry(&state).await;
            }
            Message::Shutdown(shutdown) => {
                tracing::info!(worker_id = %worker_id, reason = %shutdown.reason, "worker draining");
                break;
            }
            other => {
                tracing::warn!(worker_id = %worker_id, ?other, "unexpected frame from worker");
            }
        }
    }

    // Connection gone: requeue whatever the worker still held.
    state.writers.lock().remove(&worker_id);
    state.hungry.lock().remove(&worker_id);
    if let Some(record) = state.registry.deregister(&worker_id) {
        requeue_orphans(&state, &worker_id, record.in_flight.into_iter().collect()).await;
    }
    writer_task.abort();
}

/// Apply one worker report: retry transient outcomes, forward the rest.
async fn handle_report(state: &Arc<CoordState>, report: protocol::ActionReport) {
    state.registry.complete(&report.worker_id, &report.fingerprint);
    let outstanding = state.outstanding.lock().remove(&report.fingerprint);
    let Some(outstanding) = outstanding else {
        tracing::warn!(fingerprint = %report.fingerprint, "report for unknown assignment");
        return;
    };

    if RetryPolicy::status_retryable(report.result.status)
        && outstanding.attempt < state.retry.max_attempts
        && !state.cancel.is_cancelled()
    {
        let delay = state.retry.delay(outstanding.attempt);
        tracing::warn!(
            target_id = %outstanding.action.id.target,
            attempt = outstanding.attempt,
            ?delay,
            "action timed out on worker; re-queueing"
        );
        let state = Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            enqueue(
                &state,
                outstanding.action,
                outstanding.critical_path,
                outstanding.attempt + 1,
            );
            serve_hungry(&state).await;
        });
        return;
    }

    let _ = state
        .completions
        .send(CompletionEvent {
            action: outstanding.action,
            result: Ok(report.result),
        })
        .await;
}

/// When a hungry worker finds the queue empty, ask the most loaded peer to
/// give work up (taken from the back of its local queue).
async fn maybe_relay_steal(state: &Arc<CoordState>, thief_id: &str) {
    if !state.queue.lock().is_empty() {
        return;
    }
    let Some(victim_id) = state.registry.most_loaded(1) else {
        return;
    };
    if victim_id == thief_id {
        return;
    }
    let writer = state.writers.lock().get(&victim_id).cloned();
    if let Some(writer) = writer {
        let appetite = state
            .hungry
            .lock()
            .get(thief_id)
            .copied()
            .unwrap_or(1)
            .max(1);
        let _ = writer
            .send(Message::StealRequest(StealRequest {
                thief_id: thief_id.to_string(),
                max_actions: appetite,
            }))
            .await;
    }
}

async fn broadcast_peer(state: &Arc<CoordState>, worker_id: &str) {
    let writers: Vec<(String, mpsc::Sender<Message>)> = state
        .writers
        .lock()
        .iter()
        .map(|(id, tx)| (id.clone(), tx.clone()))
        .collect();
    for (id, writer) in writers {
        if id != worker_id {
            let _ = writer
                .send(Message::PeerAnnounce(PeerAnnounce {
                    worker_id: worker_id.to_string(),
                    addr: String::new(),
                }))
                .await;
        }
    }
}

/// Periodically reap silent workers and recycle their assignments.
async fn liveness_loop(state: Arc<CoordState>, silence_interval: Duration) {
    let tick = (silence_interval / 2).max(Duration::from_millis(50));
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = state.cancel.cancelled() => return,
        }
        for (worker_id, orphans) in state.registry.reap_silent() {
            requeue_orphans(&state, &worker_id, orphans).await;
        }
    }
}

/// Recycle assignments from a dead or disconnected worker: retry while the
/// policy allows, otherwise surface the worker death.
async fn requeue_orphans(state: &Arc<CoordState>, worker_id: &str, orphans: Vec<Digest>) {
    for fingerprint in orphans {
        let outstanding = state.outstanding.lock().remove(&fingerprint);
        let Some(outstanding) = outstanding else {
            continue;
        };
        let err = Error::WorkerDead {
            worker_id: worker_id.to_string(),
        };
        if state.retry.should_retry(&err, outstanding.attempt) && !state.cancel.is_cancelled() {
            enqueue(
                state,
                outstanding.action,
                outstanding.critical_path,
                outstanding.attempt + 1,
            );
        } else {
            let target = outstanding.action.id.target.clone();
            let _ = state
                .completions
                .send(CompletionEvent {
                    action: outstanding.action,
                    result: Err(Error::RetriesExhausted {
                        target,
                        attempts: outstanding.attempt,
                        last_error: err.to_string(),
                    }),
                })
                .await;
        }
    }
    serve_hungry(state).await;
}

/// Feed queue depth and utilization into the autoscaler and publish its
/// target.
async fn autoscaler_loop(state: Arc<CoordState>, config: AutoscalerConfig) {
    let initial = state.registry.live_count().max(1) as u32;
    let mut autoscaler = Autoscaler::new(config, initial);
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = state.cancel.cancelled() => return,
        }
        let queue_depth = state.queue.lock().len() as u32;
        let busy = state.outstanding.lock().len() as u32;
        autoscaler.observe(queue_depth, busy, Instant::now());
        state
            .desired_workers
            .store(autoscaler.target(), Ordering::Relaxed);
    }
}

/// Broadcast Shutdown to every worker once the session cancels.
async fn cancel_broadcast(state: Arc<CoordState>) {
    state.cancel.cancelled().await;
    let writers: Vec<mpsc::Sender<Message>> = state.writers.lock().values().cloned().collect();
    for writer in writers {
        let _ = writer
            .send(Message::Shutdown(Shutdown {
                reason: "session cancelled".to_string(),
            }))
            .await;
    }
}
