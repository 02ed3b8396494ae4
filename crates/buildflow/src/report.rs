//! The session summary handed back to the caller.

use buildflow_core::{Error, TargetId};
use buildflow_graph::NodeStatus;
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-target terminal statuses and session counters.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub statuses: BTreeMap<TargetId, NodeStatus>,
    /// Actions actually dispatched for execution (cache misses).
    pub executed: u64,
    /// Targets satisfied from the cache.
    pub cached: u64,
    pub failed: u64,
    pub skipped: u64,
    pub wall_time: Duration,
    /// First error observed, with its per-code suggestion; grouping and
    /// richer rendering is the caller's concern.
    pub first_error: Option<String>,
}

impl BuildReport {
    pub fn status(&self, id: &TargetId) -> Option<NodeStatus> {
        self.statuses.get(id).copied()
    }

    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Process exit-code contract: 0 success, 1 action failure.
    /// (Graph construction errors exit earlier with 2/3; invariant
    /// violations with 4 - see [`Error::exit_code`].)
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }

    pub(crate) fn note_error(&mut self, err: &Error) {
        if self.first_error.is_none() {
            let rendered = match err.suggestion() {
                Some(hint) => format!("{err} ({hint})"),
                None => err.to_string(),
            };
            self.first_error = Some(rendered);
        }
    }
}
