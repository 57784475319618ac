use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::WorkflowError;
use crate::nodes::node_type::{handles, keys};
use crate::nodes::{Branching, NodeExecutorRegistry, NodeType};

use super::types::{Edge, Node, PortSource, Selector, GLOBAL_SCOPE_ID};

/// Source handles a node may emit edges from.
pub fn source_handles(node: &Node) -> Vec<String> {
    let mut out = match node.node_type {
        NodeType::IfElse => {
            let branches = node
                .fixed_input(keys::IF_ELSE_LIST)
                .and_then(Value::as_array)
                .map(|list| list.len())
                .unwrap_or(0);
            let mut handles: Vec<String> = (0..branches).map(handles::if_else_branch).collect();
            handles.push(handles::ELSE.to_string());
            handles
        }
        NodeType::ClassifyQuestion => keyed_items(node, keys::AGENTS),
        NodeType::UserSelect => keyed_items(node, keys::USER_SELECT_OPTIONS),
        NodeType::ToolCall => vec![
            handles::SOURCE.to_string(),
            handles::SELECTED_TOOLS.to_string(),
        ],
        _ => vec![handles::SOURCE.to_string()],
    };
    if node.catch_error {
        if !out.iter().any(|h| h == handles::SOURCE) {
            out.push(handles::SOURCE.to_string());
        }
        out.push(handles::ERROR.to_string());
    }
    out
}

/// Whether the node selects among its outgoing edges.
pub fn is_branch_node(node: &Node) -> bool {
    node.catch_error || node.node_type.contract().branching == Branching::Dynamic
}

fn keyed_items(node: &Node, key: &str) -> Vec<String> {
    node.fixed_input(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("key").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Static validation of a workflow definition. Runs once, before any dispatch.
pub fn validate_graph(
    nodes: &[Node],
    edges: &[Edge],
    registry: &NodeExecutorRegistry,
) -> Result<(), WorkflowError> {
    let mut by_id: HashMap<&str, &Node> = HashMap::new();
    for node in nodes {
        if node.id.is_empty() || node.id == GLOBAL_SCOPE_ID {
            return Err(WorkflowError::GraphValidationError(format!(
                "invalid node id '{}'",
                node.id
            )));
        }
        if by_id.insert(node.id.as_str(), node).is_some() {
            return Err(WorkflowError::GraphValidationError(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
        if !registry.contains(node.node_type) {
            return Err(WorkflowError::ExecutorNotFound(
                node.node_type.as_str().to_string(),
            ));
        }
    }

    for node in nodes {
        validate_node(node, &by_id)?;
    }

    for edge in edges {
        let source = by_id
            .get(edge.source.as_str())
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.source.clone()))?;
        let target = by_id
            .get(edge.target.as_str())
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.target.clone()))?;

        if source.parent_node_id != target.parent_node_id {
            return Err(WorkflowError::GraphValidationError(format!(
                "edge {} -> {} crosses a loop boundary",
                edge.source, edge.target
            )));
        }
        if !source_handles(source).contains(&edge.source_handle) {
            return Err(WorkflowError::GraphValidationError(format!(
                "node '{}' has no output handle '{}'",
                edge.source, edge.source_handle
            )));
        }
        if edge.target_handle != handles::TARGET
            && edge.target_handle != handles::SELECTED_TOOLS
            && target.input(&edge.target_handle).is_none()
        {
            return Err(WorkflowError::GraphValidationError(format!(
                "node '{}' has no input handle '{}'",
                edge.target, edge.target_handle
            )));
        }
    }

    let scopes: HashSet<Option<&str>> = nodes.iter().map(|n| n.parent_node_id.as_deref()).collect();
    for scope in scopes {
        let in_scope: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.parent_node_id.as_deref() == scope)
            .collect();
        let has_entry = in_scope.iter().any(|n| n.is_entry())
            || in_scope
                .iter()
                .any(|n| !edges.iter().any(|e| e.target == n.id && !e.is_tool_edge()));
        if !has_entry {
            return Err(WorkflowError::NoEntryNode);
        }
    }
    Ok(())
}

fn validate_node(node: &Node, by_id: &HashMap<&str, &Node>) -> Result<(), WorkflowError> {
    let contract = node.node_type.contract();

    for spec in contract.inputs.iter().filter(|s| s.required) {
        if node.input(spec.key).is_none() {
            return Err(WorkflowError::GraphValidationError(format!(
                "node '{}' ({}) is missing required input '{}'",
                node.id, node.node_type, spec.key
            )));
        }
    }

    if let Some(parent) = &node.parent_node_id {
        match by_id.get(parent.as_str()) {
            Some(p) if p.node_type.contract().container => {}
            Some(_) => {
                return Err(WorkflowError::GraphValidationError(format!(
                    "parent of '{}' is not a loop node",
                    node.id
                )))
            }
            None => return Err(WorkflowError::NodeNotFound(parent.clone())),
        }
    }

    for input in &node.inputs {
        let selectors: Vec<Selector> = match &input.source {
            PortSource::Reference { .. } => input.source.reference_selector().into_iter().collect(),
            // Pairs naming no known node are literal arrays, not references.
            PortSource::Dynamic { value } => dynamic_selectors(value)
                .into_iter()
                .filter(|s| by_id.contains_key(s.node_id.as_str()))
                .collect(),
            PortSource::FixedValue { .. } => Vec::new(),
        };
        for selector in selectors {
            if selector.is_global() {
                continue;
            }
            let source = by_id
                .get(selector.node_id.as_str())
                .ok_or_else(|| WorkflowError::GraphValidationError(format!(
                    "input '{}' of '{}' references unknown node '{}'",
                    input.key, node.id, selector.node_id
                )))?;
            if !source.declares_output(&selector.key) {
                return Err(WorkflowError::GraphValidationError(format!(
                    "input '{}' of '{}' references undeclared output '{}.{}'",
                    input.key, node.id, selector.node_id, selector.key
                )));
            }
        }
    }
    Ok(())
}

/// Selectors carried by a dynamic port: a single `[node, key]` pair or a list of them.
pub fn dynamic_selectors(value: &Value) -> Vec<Selector> {
    if let Some(selector) = Selector::from_value(value) {
        return vec![selector];
    }
    match value.as_array() {
        Some(items) if !items.is_empty() => {
            let selectors: Vec<Selector> = items.iter().filter_map(Selector::from_value).collect();
            if selectors.len() == items.len() {
                selectors
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}
