//! The build graph: arena of nodes, eager cycle detection, deterministic
//! topological order, ready-set computation, and the status transition table.

use buildflow_core::{Error, Result, Target, TargetId};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;

/// Lifecycle status of a node within one build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Cached,
    Skipped,
}

impl NodeStatus {
    /// Terminal statuses never change within a session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Cached | NodeStatus::Skipped
        )
    }

    /// Whether this status unlocks dependents. Skipped does not: a node whose
    /// dependency was skipped can never become ready.
    pub fn unlocks_dependents(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Cached)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Cached => "cached",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What the scheduler does after a node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Cancel outstanding work; consider no new ready nodes.
    #[default]
    FailFast,
    /// Continue executing independent subtrees.
    KeepGoing,
}

/// Runtime projection of a target into the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub target: Target,
    pub status: NodeStatus,
}

/// The dependency DAG.
///
/// Nodes live in a stable arena so indices stay valid for the whole session.
/// Edges run from dependency to dependent; forward traversal therefore walks
/// in build order, and `Direction::Incoming` enumerates a node's
/// dependencies.
#[derive(Debug, Default)]
pub struct BuildGraph {
    dag: StableDiGraph<Node, ()>,
    index: HashMap<TargetId, NodeIndex>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of targets in the graph.
    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Insert a node for `target` in `Pending`.
    ///
    /// Declared dependencies are not linked here; callers wire them with
    /// [`BuildGraph::add_dependency`] once all targets exist.
    pub fn add_target(&mut self, target: Target) -> Result<NodeIndex> {
        if self.index.contains_key(&target.id) {
            return Err(Error::DuplicateTarget(target.id));
        }
        let id = target.id.clone();
        let idx = self.dag.add_node(Node {
            target,
            status: NodeStatus::Pending,
        });
        self.index.insert(id, idx);
        Ok(idx)
    }

    /// Link `child` as depending on `parent`.
    ///
    /// Rejects unknown ids and, by an eager DFS from the candidate child,
    /// edges that would close a directed cycle. On rejection the graph is
    /// unchanged and the cycle path is reported starting and ending at the
    /// would-be parent.
    pub fn add_dependency(&mut self, child: &TargetId, parent: &TargetId) -> Result<()> {
        let child_idx = self.node_index(child)?;
        let parent_idx = self.node_index(parent)?;

        if child_idx == parent_idx {
            return Err(Error::CycleDetected {
                path: vec![parent.clone(), child.clone()],
            });
        }

        // The new edge runs parent -> child. It closes a cycle iff the
        // parent is already reachable from the child along existing edges.
        if let Some(route) = self.path_between(child_idx, parent_idx) {
            let mut path = Vec::with_capacity(route.len() + 1);
            path.push(parent.clone());
            path.extend(route.into_iter().map(|idx| self.dag[idx].target.id.clone()));
            return Err(Error::CycleDetected { path });
        }

        // Parallel edges would double-count in ready tracking.
        if self.dag.find_edge(parent_idx, child_idx).is_none() {
            self.dag.add_edge(parent_idx, child_idx, ());
        }
        Ok(())
    }

    /// Depth-first search for a directed path `from -> .. -> to`, returning
    /// the node sequence (inclusive) when one exists.
    fn path_between(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<NodeIndex>> {
        let mut stack = vec![(from, false)];
        let mut path = Vec::new();
        let mut visited = std::collections::HashSet::new();

        while let Some((node, children_done)) = stack.pop() {
            if children_done {
                path.pop();
                continue;
            }
            if !visited.insert(node) {
                continue;
            }
            path.push(node);
            if node == to {
                return Some(path);
            }
            // Post-visit marker so the path unwinds correctly.
            stack.push((node, true));
            for next in self.dag.neighbors_directed(node, Direction::Outgoing) {
                if !visited.contains(&next) {
                    stack.push((next, false));
                }
            }
        }
        None
    }

    /// Resolve a target id, or fail with `UnknownTarget`.
    pub fn node_index(&self, id: &TargetId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownTarget(id.clone()))
    }

    /// Whether a target with this id exists.
    pub fn contains(&self, id: &TargetId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.dag[idx]
    }

    pub fn status(&self, idx: NodeIndex) -> NodeStatus {
        self.dag[idx].status
    }

    pub fn target_id(&self, idx: NodeIndex) -> &TargetId {
        &self.dag[idx].target.id
    }

    /// All node indices, in arbitrary order.
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.dag.node_indices()
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.dag.neighbors_directed(idx, Direction::Incoming)
    }

    /// Direct dependents of a node (the invalidation back-index).
    pub fn dependents(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.dag.neighbors_directed(idx, Direction::Outgoing)
    }

    /// Deterministic topological order.
    ///
    /// Kahn's algorithm with a min-heap keyed by target id, so ties within a
    /// topological level always break lexicographically and the sequence is
    /// identical across runs for a fixed target set.
    pub fn topological_sort(&self) -> Vec<NodeIndex> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .dag
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.dag.edges_directed(idx, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<(TargetId, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(idx, _)| Reverse((self.dag[*idx].target.id.clone(), *idx)))
            .collect();

        let mut order = Vec::with_capacity(self.dag.node_count());
        while let Some(Reverse((_, idx))) = heap.pop() {
            order.push(idx);
            for edge in self.dag.edges_directed(idx, Direction::Outgoing) {
                let next = edge.target();
                let deg = in_degree
                    .get_mut(&next)
                    .filter(|d| **d > 0);
                if let Some(deg) = deg {
                    *deg -= 1;
                    if *deg == 0 {
                        heap.push(Reverse((self.dag[next].target.id.clone(), next)));
                    }
                }
            }
        }
        order
    }

    /// The ready set: Pending nodes whose dependencies all reached a
    /// terminal-success status (Success or Cached). Pure function of the
    /// current statuses; calling it twice without intervening marks returns
    /// the same set.
    pub fn ready_nodes(&self) -> Vec<NodeIndex> {
        let mut ready: Vec<NodeIndex> = self
            .dag
            .node_indices()
            .filter(|idx| self.dag[*idx].status == NodeStatus::Pending)
            .filter(|idx| {
                self.dependencies(*idx)
                    .all(|dep| self.dag[dep].status.unlocks_dependents())
            })
            .collect();
        // Deterministic emission order.
        ready.sort_by(|a, b| self.dag[*a].target.id.cmp(&self.dag[*b].target.id));
        ready
    }

    /// Transition a node's status.
    ///
    /// Permitted transitions only: Pending -> Ready, Ready -> Running,
    /// Running -> {Success, Failed, Cached}, Pending -> Skipped. Anything else is
    /// a contract violation.
    pub fn mark(&mut self, idx: NodeIndex, new_status: NodeStatus) -> Result<()> {
        let node = &mut self.dag[idx];
        let permitted = matches!(
            (node.status, new_status),
            (NodeStatus::Pending, NodeStatus::Ready)
                | (NodeStatus::Ready, NodeStatus::Running)
                | (NodeStatus::Running, NodeStatus::Success)
                | (NodeStatus::Running, NodeStatus::Failed)
                | (NodeStatus::Running, NodeStatus::Cached)
                | (NodeStatus::Pending, NodeStatus::Skipped)
        );
        if !permitted {
            return Err(Error::InvariantViolation(format!(
                "illegal status transition {} -> {} for target {}",
                node.status, new_status, node.target.id
            )));
        }
        tracing::trace!(target_id = %node.target.id, from = %node.status, to = %new_status, "mark");
        node.status = new_status;
        Ok(())
    }

    /// Mark all transitive dependents of a failed node as Skipped.
    ///
    /// Only Pending dependents transition; independent subtrees are
    /// untouched. Returns the skipped indices.
    pub fn failure_propagation(&mut self, failed: NodeIndex) -> Result<Vec<NodeIndex>> {
        let mut skipped = Vec::new();
        let mut stack: Vec<NodeIndex> = self.dependents(failed).collect();
        let mut seen = std::collections::HashSet::new();

        while let Some(idx) = stack.pop() {
            if !seen.insert(idx) {
                continue;
            }
            if self.dag[idx].status == NodeStatus::Pending {
                self.mark(idx, NodeStatus::Skipped)?;
                skipped.push(idx);
            }
            stack.extend(self.dependents(idx));
        }
        Ok(skipped)
    }

    /// Whether every node reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.dag
            .node_indices()
            .all(|idx| self.dag[idx].status.is_terminal())
    }
}
