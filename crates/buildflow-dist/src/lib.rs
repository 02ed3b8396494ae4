//! Distributed coordinator and work-stealing execution pool.
//!
//! Accepts ready actions from the scheduler and drives them to completion
//! across local worker tasks and/or remote hosts:
//!
//! - [`LocalPool`] - in-process workers over Chase-Lev deques (crossbeam);
//!   idle workers steal from the opposite end of a loaded peer's queue.
//! - [`CoordinatorServer`] / [`RemoteWorker`] - TCP coordinator speaking the
//!   length-prefixed binary protocol of [`protocol`]; workers register,
//!   heartbeat, pull batches, and push results; silent workers are declared
//!   dead and their in-flight actions reassigned.
//! - [`Autoscaler`] - smoothed-load + trend target for the desired worker
//!   count; aggressive up, conservative down.
//!
//! The seam toward the scheduler is a pair of channels: a bounded dispatch
//! channel (backpressure propagates to the scheduler when full) and a
//! completion channel applied in arrival order.

pub mod autoscaler;
pub mod backoff;
pub mod coordinator;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod worker;

pub use autoscaler::{Autoscaler, AutoscalerConfig};
pub use backoff::RetryPolicy;
pub use coordinator::{CoordinatorHandle, CoordinatorServer};
pub use pool::{LocalPool, LocalPoolConfig};
pub use registry::{WorkerCapabilities, WorkerRecord, WorkerRegistry, WorkerState};
pub use worker::RemoteWorker;

use buildflow_core::{Action, ActionResult, Result};

/// One unit of work handed to the dispatch layer.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub action: Action,
    /// Critical-path length of the emitting node; combined with the action's
    /// explicit priority hint for queue ordering.
    pub critical_path: u32,
}

/// Terminal outcome of one dispatched action, pushed back to the scheduler.
#[derive(Debug)]
pub struct CompletionEvent {
    /// The action as dispatched (the scheduler correlates by target id and
    /// checks declared outputs against it).
    pub action: Action,
    /// The execution outcome; `Err` carries infrastructure failures that
    /// survived the retry policy.
    pub result: Result<ActionResult>,
}

/// Effective queue priority: explicit hint dominates, critical path breaks
/// ties, arrival order breaks the rest.
pub(crate) fn priority_key(action: &Action, critical_path: u32) -> u64 {
    ((action.priority as u64) << 32) | critical_path as u64
}
