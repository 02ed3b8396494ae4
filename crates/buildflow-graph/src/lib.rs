//! Dependency graph and scheduler state machine.
//!
//! The graph owns one [`Node`] per target, arranged in a directed acyclic
//! graph stored in a petgraph arena. Edges point from dependency to
//! dependent, so topological order emits dependencies first. The graph is
//! constructed at session start from parsed targets, mutated only by the
//! scheduler, and discarded at session end.
//!
//! Status progression is monotonic: once a node reaches a terminal status
//! (Success, Failed, Cached, Skipped) it does not change within a build
//! session. Illegal transitions are contract violations and surface as
//! [`buildflow_core::Error::InvariantViolation`].

mod critical_path;
mod dot;
mod graph;

pub use critical_path::critical_path_lengths;
pub use dot::to_dot;
pub use graph::{BuildGraph, FailurePolicy, Node, NodeStatus};

pub use petgraph::stable_graph::NodeIndex;
