//! Worker registry: liveness, load, capability tags, in-flight tracking.
//!
//! The coordinator exclusively owns the registry; mutations are rare
//! (connect, disconnect, heartbeat), so a reader/writer lock over a plain
//! map is the right shape. Workers silent past the configured interval are
//! marked Dead and their in-flight fingerprints handed back for
//! reassignment.

use buildflow_core::Digest;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

/// What a worker can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub os: String,
    pub arch: String,
    pub tools: BTreeSet<String>,
}

impl WorkerCapabilities {
    /// Capabilities of the machine we are running on.
    #[must_use]
    pub fn detect_local() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            tools: BTreeSet::new(),
        }
    }
}

/// Lifecycle of one worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Idle,
    Executing,
    Draining,
    Dead,
}

/// Everything the coordinator tracks per worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub state: WorkerState,
    pub last_heartbeat: Instant,
    /// Load factor in [0.0, 1.0].
    pub load: f64,
    pub queue_depth: u32,
    pub capacity: u32,
    pub capabilities: WorkerCapabilities,
    /// Fingerprints currently assigned to this worker.
    pub in_flight: HashSet<Digest>,
}

/// Registry of connected workers.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRecord>>,
    /// Silence past this interval marks a worker Dead.
    silence_interval: Duration,
}

impl WorkerRegistry {
    pub fn new(silence_interval: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            silence_interval,
        }
    }

    pub fn register(&self, id: String, capabilities: WorkerCapabilities, capacity: u32) {
        let record = WorkerRecord {
            id: id.clone(),
            state: WorkerState::Idle,
            last_heartbeat: Instant::now(),
            load: 0.0,
            queue_depth: 0,
            capacity,
            capabilities,
            in_flight: HashSet::new(),
        };
        tracing::info!(worker_id = %id, capacity, "worker registered");
        self.workers.write().insert(id, record);
    }

    pub fn deregister(&self, id: &str) -> Option<WorkerRecord> {
        tracing::info!(worker_id = %id, "worker deregistered");
        self.workers.write().remove(id)
    }

    pub fn heartbeat(&self, id: &str, load: f64, queue_depth: u32) {
        if let Some(record) = self.workers.write().get_mut(id) {
            record.last_heartbeat = Instant::now();
            record.load = load.clamp(0.0, 1.0);
            record.queue_depth = queue_depth;
            if record.state == WorkerState::Dead {
                // A heartbeat from the dead means the silence was a network
                // hiccup; treat it as a fresh idle worker.
                record.state = WorkerState::Idle;
            }
        }
    }

    /// Record an assignment.
    pub fn assign(&self, id: &str, fingerprint: Digest) {
        if let Some(record) = self.workers.write().get_mut(id) {
            record.in_flight.insert(fingerprint);
            record.state = WorkerState::Executing;
        }
    }

    /// Record a completion; the worker goes Idle when nothing remains.
    pub fn complete(&self, id: &str, fingerprint: &Digest) {
        if let Some(record) = self.workers.write().get_mut(id) {
            record.in_flight.remove(fingerprint);
            if record.in_flight.is_empty() && record.state == WorkerState::Executing {
                record.state = WorkerState::Idle;
            }
        }
    }

    /// Mark silent workers Dead; returns `(worker_id, in_flight)` for every
    /// newly-dead worker so the dispatch layer can reassign.
    pub fn reap_silent(&self) -> Vec<(String, Vec<Digest>)> {
        let mut dead = Vec::new();
        let mut workers = self.workers.write();
        for record in workers.values_mut() {
            if record.state != WorkerState::Dead
                && record.last_heartbeat.elapsed() > self.silence_interval
            {
                record.state = WorkerState::Dead;
                let orphaned: Vec<Digest> = record.in_flight.drain().collect();
                tracing::warn!(
                    worker_id = %record.id,
                    orphaned = orphaned.len(),
                    "worker silent past deadline; marking dead"
                );
                dead.push((record.id.clone(), orphaned));
            }
        }
        dead
    }

    /// The live worker with the most queued actions (steal victim), if any
    /// has more than `min_depth` queued.
    pub fn most_loaded(&self, min_depth: u32) -> Option<String> {
        self.workers
            .read()
            .values()
            .filter(|r| r.state != WorkerState::Dead && r.queue_depth > min_depth)
            .max_by_key(|r| r.queue_depth)
            .map(|r| r.id.clone())
    }

    pub fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.workers.read().get(id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.workers
            .read()
            .values()
            .filter(|r| r.state != WorkerState::Dead)
            .count()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Mean load over live workers, in [0.0, 1.0].
    pub fn mean_load(&self) -> f64 {
        let workers = self.workers.read();
        let live: Vec<&WorkerRecord> = workers
            .values()
            .filter(|r| r.state != WorkerState::Dead)
            .collect();
        if live.is_empty() {
            return 0.0;
        }
        live.iter().map(|r| r.load).sum::<f64>() / live.len() as f64
    }
}
