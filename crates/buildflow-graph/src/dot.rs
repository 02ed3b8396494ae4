//! Graphviz export, mainly for locating reported cycles and debugging
//! scheduling decisions.

use crate::graph::BuildGraph;

/// Render the graph in Graphviz dot syntax. Node labels carry the current
/// status so a snapshot mid-build shows where the session stands.
pub fn to_dot(graph: &BuildGraph) -> String {
    let mut out = String::from("digraph build {\n    rankdir=LR;\n");
    let mut nodes: Vec<_> = graph.node_indices().collect();
    nodes.sort_by(|a, b| graph.target_id(*a).cmp(graph.target_id(*b)));

    for idx in &nodes {
        let node = graph.node(*idx);
        out.push_str(&format!(
            "    \"{}\" [label=\"{}\\n{}\"];\n",
            node.target.id, node.target.id, node.status
        ));
    }
    for idx in &nodes {
        let mut deps: Vec<_> = graph.dependents(*idx).collect();
        deps.sort_by(|a, b| graph.target_id(*a).cmp(graph.target_id(*b)));
        for dep in deps {
            out.push_str(&format!(
                "    \"{}\" -> \"{}\";\n",
                graph.target_id(*idx),
                graph.target_id(dep)
            ));
        }
    }
    out.push_str("}\n");
    out
}
