//! Shared fabric for the buildflow build engine kernel.
//!
//! Everything that crosses a component boundary lives here: content digests,
//! the action data model, the typed error taxonomy, and the binary codec used
//! for the on-disk index and the wire protocol. The kernel crates
//! (`buildflow-graph`, `buildflow-cache`, `buildflow-sandbox`,
//! `buildflow-dist`) depend only on this crate and on each other's public
//! contracts; actions and results are value types passed by move.

pub mod action;
pub mod codec;
pub mod digest;
pub mod error;

pub use action::{
    Action, ActionId, ActionKind, ActionResult, ActionStatus, ExecutionMetadata, ResourceLimits,
    ResourceUsage, Target, TargetId, TargetKind,
};
pub use digest::Digest;
pub use error::{Error, ErrorClass, LimitDimension, Result};

// The cancellation token is checked at every suspension point in the engine,
// the dispatch layer, and the sandbox. Re-exported so downstream crates agree
// on one type.
pub use tokio_util::sync::CancellationToken;
