use async_trait::async_trait;
use serde_json::Value;

use crate::error::NodeError;
use crate::evaluator::{evaluate_if_else, ConditionGroup};
use crate::graph::Node;
use crate::nodes::executor::{EdgeRouting, NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::keys;
use crate::template::value_to_text;

// ================================
// Start Node
// ================================

/// Publishes the run's entry values (user input and run variables) as outputs.
pub struct StartNodeExecutor;

#[async_trait]
impl NodeExecutor for StartNodeExecutor {
    async fn execute(
        &self,
        _node: &Node,
        inputs: &NodeInputs,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let mut outputs = inputs.values().clone();
        outputs
            .entry(keys::USER_CHAT_INPUT.to_string())
            .or_insert_with(|| Value::String(String::new()));
        Ok(NodeRunResult::with_outputs(outputs))
    }
}

// ================================
// Answer Node
// ================================

pub struct AnswerNodeExecutor;

#[async_trait]
impl NodeExecutor for AnswerNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let text = inputs.get(keys::TEXT).map(value_to_text).unwrap_or_default();
        if !text.is_empty() {
            ctx.emitter.stream(&node.id, text.clone()).await;
        }
        let mut result =
            NodeRunResult::default().output(keys::ANSWER_TEXT, Value::String(text.clone()));
        result.answer_text = Some(text);
        Ok(result)
    }
}

// ================================
// If-Else Node
// ================================

pub struct IfElseNodeExecutor;

#[async_trait]
impl NodeExecutor for IfElseNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let groups: Vec<ConditionGroup> = inputs.parse(keys::IF_ELSE_LIST)?;
        let handle = evaluate_if_else(&groups, ctx.pool);
        tracing::debug!(node_id = %node.id, branch = %handle, "if-else evaluated");
        Ok(NodeRunResult::default()
            .output(keys::IF_ELSE_RESULT, Value::String(handle.clone()))
            .routed(EdgeRouting::Only(handle)))
    }
}

// ================================
// Text Editor Node
// ================================

/// Fills `{{key}}` placeholders in its text from the node's other inputs.
pub struct TextEditorNodeExecutor;

#[async_trait]
impl NodeExecutor for TextEditorNodeExecutor {
    async fn execute(
        &self,
        _node: &Node,
        inputs: &NodeInputs,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let mut text = inputs.str(keys::TEXTAREA_INPUT).to_string();
        let mut custom: Vec<(&String, &Value)> = inputs
            .values()
            .iter()
            .filter(|(k, _)| k.as_str() != keys::TEXTAREA_INPUT)
            .collect();
        custom.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in custom {
            text = text.replace(&format!("{{{{{}}}}}", key), &value_to_text(value));
        }
        Ok(NodeRunResult::default().output(keys::TEXT_OUTPUT, Value::String(text)))
    }
}

// ================================
// Stop Tool Node
// ================================

/// Ends the dispatch it runs in. Inside a tool call this ends the tool loop.
pub struct StopToolNodeExecutor;

#[async_trait]
impl NodeExecutor for StopToolNodeExecutor {
    async fn execute(
        &self,
        _node: &Node,
        _inputs: &NodeInputs,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        Ok(NodeRunResult {
            stop_run: true,
            ..Default::default()
        })
    }
}

// ================================
// Pass-through Nodes
// ================================

/// Loop start/end and plugin input/output: outputs are the inputs.
pub struct PassThroughExecutor;

#[async_trait]
impl NodeExecutor for PassThroughExecutor {
    async fn execute(
        &self,
        _node: &Node,
        inputs: &NodeInputs,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        Ok(NodeRunResult::with_outputs(inputs.values().clone()))
    }
}
