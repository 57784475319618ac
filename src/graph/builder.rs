use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::WorkflowError;
use crate::nodes::NodeExecutorRegistry;

use super::traversal::{classify_incoming, EdgeView, IncomingGroups};
use super::types::{Edge, EdgeStatus, Node};
use super::validator::{is_branch_node, validate_graph};

/// Immutable, validated workflow graph shared by every dispatch over it.
///
/// Runtime edge statuses live in the dispatcher, never here, so one `Graph`
/// can serve concurrent runs and nested dispatches.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    node_index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Node index -> outgoing non-tool edges, in declaration order.
    outgoing: Vec<Vec<usize>>,
    /// Node index -> outgoing tool edges.
    tool_edges: Vec<Vec<usize>>,
    incoming_groups: Vec<IncomingGroups>,
    is_tool_target: Vec<bool>,
}

impl Graph {
    /// Validates and indexes a workflow definition.
    pub fn build(
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        registry: &NodeExecutorRegistry,
    ) -> Result<Self, WorkflowError> {
        validate_graph(&nodes, &edges, registry)?;

        let node_index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let idx = |id: &str| {
            node_index
                .get(id)
                .copied()
                .ok_or_else(|| WorkflowError::NodeNotFound(id.to_string()))
        };

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut tool_edges = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        let mut is_tool_target = vec![false; nodes.len()];
        let mut views = Vec::with_capacity(edges.len());
        let mut topology: DiGraph<usize, usize> = DiGraph::with_capacity(nodes.len(), edges.len());
        let graph_nodes: Vec<NodeIndex> = (0..nodes.len()).map(|i| topology.add_node(i)).collect();

        for (i, edge) in edges.iter().enumerate() {
            let source = idx(&edge.source)?;
            let target = idx(&edge.target)?;
            views.push(EdgeView {
                source,
                target,
                handle: edge.source_handle.as_str(),
            });
            if edge.is_tool_edge() {
                tool_edges[source].push(i);
                is_tool_target[target] = true;
                continue;
            }
            outgoing[source].push(i);
            incoming[target].push(i);
            topology.add_edge(graph_nodes[source], graph_nodes[target], i);
        }

        // An edge lies on a cycle iff both ends share a strongly connected component.
        let mut component = vec![0usize; nodes.len()];
        for (c, scc) in tarjan_scc(&topology).into_iter().enumerate() {
            for n in scc {
                component[topology[n]] = c;
            }
        }
        let on_cycle = |e: usize| component[views[e].source] == component[views[e].target];

        let is_branch: Vec<bool> = nodes.iter().map(is_branch_node).collect();
        let incoming_groups = (0..nodes.len())
            .map(|n| classify_incoming(n, &views, &incoming, &is_branch, on_cycle))
            .collect();

        tracing::debug!(
            nodes = nodes.len(),
            edges = edges.len(),
            "workflow graph built"
        );

        Ok(Self {
            nodes,
            node_index,
            edges,
            outgoing,
            tool_edges,
            incoming_groups,
            is_tool_target,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.node_index.get(id).copied()
    }

    pub fn node_at(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn edge(&self, index: usize) -> &Edge {
        &self.edges[index]
    }

    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    pub fn incoming_groups(&self, node: usize) -> &IncomingGroups {
        &self.incoming_groups[node]
    }

    /// All non-tool incoming edges, common and recursive.
    pub fn incoming(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        let groups = &self.incoming_groups[node];
        groups
            .common
            .iter()
            .chain(groups.recursive.iter().flatten())
            .copied()
    }

    /// Tool nodes attached to a tool-call node, in declaration order.
    pub fn tool_targets(&self, node: usize) -> Vec<&Node> {
        self.tool_edges[node]
            .iter()
            .filter_map(|&e| self.node(&self.edges[e].target))
            .collect()
    }

    /// Initial runtime status of every edge.
    pub fn initial_edge_status(&self) -> Vec<EdgeStatus> {
        self.edges
            .iter()
            .map(|e| e.status.unwrap_or_default())
            .collect()
    }

    /// Nodes belonging to a scope: top level for `None`, a loop body otherwise.
    pub fn scope_nodes<'a>(&'a self, scope: Option<&'a str>) -> impl Iterator<Item = usize> + 'a {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.parent_node_id.as_deref() == scope)
            .map(|(i, _)| i)
    }

    /// Entry nodes of a scope. Typed entries win; otherwise nodes without
    /// incoming edges that are not tool nodes.
    pub fn entry_nodes(&self, scope: Option<&str>) -> Vec<usize> {
        let typed: Vec<usize> = self
            .scope_nodes(scope)
            .filter(|&i| self.nodes[i].is_entry())
            .collect();
        if !typed.is_empty() {
            return typed;
        }
        self.scope_nodes(scope)
            .filter(|&i| self.incoming_groups[i].is_empty() && !self.is_tool_target[i])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::InputPort;
    use crate::nodes::node_type::keys;
    use crate::nodes::NodeType;
    use serde_json::json;

    fn registry() -> NodeExecutorRegistry {
        NodeExecutorRegistry::with_builtins()
    }

    fn answer(id: &str) -> Node {
        Node::new(id, NodeType::Answer).with_input(InputPort::fixed("text", json!(id)))
    }

    #[test]
    fn test_build_linear() {
        let graph = Graph::build(
            vec![Node::new("start", NodeType::WorkflowStart), answer("a")],
            vec![Edge::new("start", "a")],
            &registry(),
        )
        .unwrap();
        assert_eq!(graph.entry_nodes(None), vec![0]);
        assert_eq!(graph.outgoing(0), &[0]);
        assert_eq!(graph.incoming_groups(1).common, vec![0]);
    }

    #[test]
    fn test_loop_children_form_own_scope() {
        let nodes = vec![
            Node::new("start", NodeType::WorkflowStart),
            Node::new("loop", NodeType::Loop),
            Node::new("ls", NodeType::LoopStart).with_parent("loop"),
            Node::new("le", NodeType::LoopEnd).with_parent("loop"),
        ];
        let edges = vec![Edge::new("start", "loop"), Edge::new("ls", "le")];
        let graph = Graph::build(nodes, edges, &registry()).unwrap();
        assert_eq!(graph.entry_nodes(None), vec![0]);
        assert_eq!(graph.entry_nodes(Some("loop")), vec![2]);
        assert_eq!(graph.scope_nodes(Some("loop")).count(), 2);
    }

    #[test]
    fn test_branch_cycle_classification() {
        let cond = json!([{"condition": "AND", "list": []}]);
        let nodes = vec![
            Node::new("start", NodeType::WorkflowStart),
            answer("work"),
            Node::new("check", NodeType::IfElse)
                .with_input(InputPort::fixed(keys::IF_ELSE_LIST, cond)),
            answer("done"),
        ];
        let edges = vec![
            Edge::new("start", "work"),
            Edge::new("work", "check"),
            Edge::new("check", "work").with_handle("IF"),
            Edge::new("check", "done").with_handle("ELSE"),
        ];
        let graph = Graph::build(nodes, edges, &registry()).unwrap();
        let groups = graph.incoming_groups(1);
        assert_eq!(groups.common, vec![0]);
        assert_eq!(groups.recursive, vec![vec![2]]);
    }

    #[test]
    fn test_tool_nodes_are_not_entries() {
        let agent = Node::new("agent", NodeType::ToolCall)
            .with_input(InputPort::fixed(keys::MODEL, json!("m")))
            .with_input(InputPort::fixed(keys::USER_CHAT_INPUT, json!("q")));
        let nodes = vec![Node::new("start", NodeType::WorkflowStart), agent, answer("tool")];
        let edges = vec![
            Edge::new("start", "agent"),
            Edge::new("agent", "tool").with_handle("selectedTools"),
        ];
        let graph = Graph::build(nodes, edges, &registry()).unwrap();
        assert_eq!(graph.tool_targets(1).len(), 1);
        assert!(graph.incoming_groups(2).is_empty());
        assert_eq!(graph.entry_nodes(None), vec![0]);
    }
}
