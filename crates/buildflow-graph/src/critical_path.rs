//! Critical-path lengths for dispatch priority.
//!
//! The critical path of a node is the longest chain of dependents hanging on
//! it; nodes with long chains gate the most downstream work and should run
//! first. Computed in one pass over the reverse topological order.

use crate::graph::BuildGraph;
use petgraph::stable_graph::NodeIndex;
use std::collections::HashMap;

/// Longest dependent-chain length for every node.
///
/// A sink (nothing depends on it) has length 0; each step toward the roots
/// adds one. The scheduler combines this with the action's explicit priority
/// hint when ordering the dispatch queue.
pub fn critical_path_lengths(graph: &BuildGraph) -> HashMap<NodeIndex, u32> {
    let order = graph.topological_sort();
    let mut lengths: HashMap<NodeIndex, u32> = HashMap::with_capacity(order.len());

    for idx in order.iter().rev() {
        let longest_dependent = graph
            .dependents(*idx)
            .filter_map(|dep| lengths.get(&dep))
            .max()
            .copied();
        let length = match longest_dependent {
            Some(len) => len + 1,
            None => 0,
        };
        lengths.insert(*idx, length);
    }
    lengths
}
