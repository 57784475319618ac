//! Plugin module node: calls another workflow from the graph arena as a
//! sub-workflow, one level deeper, with a fresh variable pool.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::outcome::RunOutcome;
use crate::core::sub_graph_runner::{reject_pause, run_sub_graph, SubGraphRequest};
use crate::core::variable_pool::VariablePool;
use crate::error::NodeError;
use crate::graph::Node;
use crate::nodes::executor::{NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::{keys, NodeType};

pub struct PluginModuleExecutor;

#[async_trait]
impl NodeExecutor for PluginModuleExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let plugin_id = inputs.require_str(keys::PLUGIN_ID)?;
        let max_depth = ctx.env.config.max_workflow_depth;
        if ctx.run.depth >= max_depth {
            return Err(NodeError::DepthExceeded(max_depth));
        }
        let graph = ctx
            .env
            .capabilities
            .workflows
            .get(plugin_id)
            .ok_or_else(|| NodeError::ConfigError(format!("unknown plugin '{}'", plugin_id)))?;

        let params: HashMap<String, Value> = inputs
            .values()
            .iter()
            .filter(|(k, _)| k.as_str() != keys::PLUGIN_ID)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let output_nodes: Vec<String> = graph
            .nodes()
            .iter()
            .filter(|n| n.node_type == NodeType::PluginOutput)
            .map(|n| n.id.clone())
            .collect();
        tracing::debug!(
            node_id = %node.id,
            plugin_id = %plugin_id,
            depth = ctx.run.depth + 1,
            "running plugin"
        );

        let request = SubGraphRequest::new(graph, VariablePool::new(), ctx.run.deeper())
            .with_params(params);
        let nested = run_sub_graph(ctx.env.clone(), ctx.emitter.nested(&node.id), request)
            .await
            .map_err(|e| NodeError::SubWorkflowError(format!("plugin '{}': {}", plugin_id, e)))?;
        reject_pause(&nested.outcome)?;

        let (response, halt) = match nested.outcome {
            RunOutcome::Completed(response) => (response, None),
            // The nested records are billed whether or not the plugin finished.
            RunOutcome::Failed { response, failure } => (response, Some(failure.into_node_error())),
            RunOutcome::Paused { .. } => {
                return Err(NodeError::ExecutionError("plugin paused".to_string()))
            }
        };

        let mut result = NodeRunResult::default();
        for id in &output_nodes {
            if let Some(outputs) = response.node_outputs.get(id) {
                result
                    .outputs
                    .extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        if !response.final_answer.is_empty() {
            result.answer_text = Some(response.final_answer);
        }
        result.children = response.usage;
        result.halt = halt;
        Ok(result)
    }
}
