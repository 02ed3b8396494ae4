//! Remote worker: connects to a coordinator, pulls action batches, executes
//! them in the local sandbox, reports results, and yields queued work to
//! steal requests (from the back of its queue, newest first).

use crate::protocol::{
    self, ActionRequest, HeartBeat, Message, Registration, Shutdown, StealResponse, WorkRequest,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use crate::registry::WorkerCapabilities;
use buildflow_core::{
    Action, ActionResult, ActionStatus, CancellationToken, Error, Result,
};
use buildflow_sandbox::Sandbox;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// One worker process's connection to the coordinator.
pub struct RemoteWorker {
    id: String,
    capacity: u32,
    heartbeat_interval: Duration,
    sandbox: Arc<Sandbox>,
}

impl RemoteWorker {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            id: format!("worker-{}", uuid::Uuid::new_v4()),
            capacity: num_cpus::get() as u32,
            heartbeat_interval: Duration::from_secs(1),
            sandbox,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connect, register, and serve until shutdown or cancellation.
    pub async fn run(self, coordinator_addr: &str, cancel: CancellationToken) -> Result<()> {
        let socket = TcpStream::connect(coordinator_addr)
            .await
            .map_err(|e| Error::Transport(format!("connect {coordinator_addr}: {e}")))?;
        let (mut reader, mut writer) = socket.into_split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if protocol::write_message(&mut writer, &message).await.is_err() {
                    break;
                }
            }
        });

        outbound_tx
            .send(Message::Registration(Registration {
                magic: PROTOCOL_MAGIC,
                protocol_version: PROTOCOL_VERSION,
                worker_id: self.id.clone(),
                capabilities: WorkerCapabilities::detect_local(),
                capacity: self.capacity,
            }))
            .await
            .map_err(|_| Error::Transport("registration send failed".to_string()))?;

        let queue: Arc<Mutex<VecDeque<ActionRequest>>> = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicU32::new(0));
        let draining = CancellationToken::new();

        // Executors: pull from the front of the local queue.
        let mut executor_tasks = Vec::new();
        for _ in 0..self.capacity {
            executor_tasks.push(tokio::spawn(executor_loop(
                self.id.clone(),
                Arc::clone(&self.sandbox),
                Arc::clone(&queue),
                Arc::clone(&running),
                outbound_tx.clone(),
                cancel.clone(),
                draining.clone(),
            )));
        }

        // Heartbeats double as work requests while capacity is free.
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            self.id.clone(),
            self.capacity,
            self.heartbeat_interval,
            Arc::clone(&queue),
            Arc::clone(&running),
            outbound_tx.clone(),
            draining.clone(),
        ));

        loop {
            let message = tokio::select! {
                message = protocol::read_message(&mut reader) => message,
                () = cancel.cancelled() => {
                    let _ = outbound_tx
                        .send(Message::Shutdown(Shutdown { reason: "cancelled".into() }))
                        .await;
                    break;
                }
            };
            match message {
                Ok(Some(Message::ActionRequest(request))) => {
                    queue.lock().push_back(request);
                }
                Ok(Some(Message::StealRequest(steal))) => {
                    // Give up from the back: the work we'd touch last.
                    let mut stolen = Vec::new();
                    {
                        let mut queue = queue.lock();
                        for _ in 0..steal.max_actions {
                            match queue.pop_back() {
                                Some(request) => stolen.push(request.action),
                                None => break,
                            }
                        }
                    }
                    tracing::debug!(
                        thief = %steal.thief_id,
                        stolen = stolen.len(),
                        "yielding work to steal request"
                    );
                    let _ = outbound_tx
                        .send(Message::StealResponse(StealResponse { actions: stolen }))
                        .await;
                }
                Ok(Some(Message::Shutdown(shutdown))) => {
                    tracing::info!(reason = %shutdown.reason, "coordinator requested shutdown");
                    break;
                }
                Ok(Some(Message::PeerAnnounce(peer))) => {
                    tracing::debug!(peer = %peer.worker_id, "peer announced");
                }
                Ok(Some(other)) => {
                    tracing::warn!(?other, "unexpected frame from coordinator");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "coordinator connection failed");
                    break;
                }
            }
        }

        // Drain: let executors finish what is queued and running.
        while running.load(Ordering::SeqCst) > 0 || !queue.lock().is_empty() {
            if cancel.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        draining.cancel();
        for task in executor_tasks {
            let _ = task.await;
        }
        heartbeat_task.abort();
        drop(outbound_tx);
        let _ = writer_task.await;
        Ok(())
    }
}

async fn executor_loop(
    worker_id: String,
    sandbox: Arc<Sandbox>,
    queue: Arc<Mutex<VecDeque<ActionRequest>>>,
    running: Arc<AtomicU32>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    draining: CancellationToken,
) {
    loop {
        let next = queue.lock().pop_front();
        let request = match next {
            Some(request) => request,
            None => {
                if draining.is_cancelled() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
        };

        running.fetch_add(1, Ordering::SeqCst);
        let fingerprint = request.action.fingerprint();
        let mut result = execute_one(&sandbox, &request.action, &cancel).await;
        result.metadata.worker_id = worker_id.clone();
        running.fetch_sub(1, Ordering::SeqCst);

        let report = Message::ActionResult(protocol::ActionReport {
            worker_id: worker_id.clone(),
            fingerprint,
            result,
        });
        if outbound.send(report).await.is_err() {
            return;
        }
    }
}

/// Execute one action; every failure mode is folded into an `ActionResult`
/// so it can cross the wire (the coordinator classifies by status).
async fn execute_one(
    sandbox: &Sandbox,
    action: &Action,
    cancel: &CancellationToken,
) -> ActionResult {
    match sandbox.execute(action, cancel).await {
        Ok(result) => {
            if result.is_success() {
                if let Some(missing) = missing_output(sandbox, action, &result) {
                    return failure_result(&format!("declared output not produced: {missing}"));
                }
            }
            result
        }
        Err(err) => failure_result(&err.to_string()),
    }
}

fn missing_output(sandbox: &Sandbox, action: &Action, result: &ActionResult) -> Option<String> {
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
            return Some(declared.display().to_string());
        }
    }
    None
}

fn failure_result(reason: &str) -> ActionResult {
    ActionResult {
        status: ActionStatus::Failure,
        exit_code: -1,
        stdout: Vec::new(),
        stderr: reason.as_bytes().to_vec(),
        outputs: Default::default(),
        usage: Default::default(),
        metadata: Default::default(),
    }
}

async fn heartbeat_loop(
    worker_id: String,
    capacity: u32,
    interval: Duration,
    queue: Arc<Mutex<VecDeque<ActionRequest>>>,
    running: Arc<AtomicU32>,
    outbound: mpsc::Sender<Message>,
    draining: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = draining.cancelled() => return,
        }
        let queued = queue.lock().len() as u32;
        let busy = running.load(Ordering::SeqCst);
        let load = f64::from(busy) / f64::from(capacity.max(1));

        if outbound
            .send(Message::HeartBeat(HeartBeat {
                worker_id: worker_id.clone(),
                load,
                queue_depth: queued,
            }))
            .await
            .is_err()
        {
            return;
        }

        let in_hand = queued + busy;
        if in_hand < capacity {
            let _ = outbound
                .send(Message::WorkRequest(WorkRequest {
                    worker_id: worker_id.clone(),
                    capacity: capacity - in_hand,
                }))
                .await;
        }
    }
}
