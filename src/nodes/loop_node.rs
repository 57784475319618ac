//! Loop node: runs its child nodes once per element of `loopInputArray`, or
//! until `loopBreakCondition` holds. Every iteration is a nested dispatch of
//! the loop's scope over a fresh overlay of the owner's pool, so iterations
//! never see each other's node outputs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::outcome::RunOutcome;
use crate::core::sub_graph_runner::{reject_pause, run_sub_graph, SubGraphRequest};
use crate::core::variable_pool::{OverlayKind, VariablePool};
use crate::error::NodeError;
use crate::evaluator::{evaluate_group, ConditionGroup};
use crate::graph::Node;
use crate::nodes::executor::{NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::{keys, NodeType};

/// Break condition of a loop: one group or a list of groups, any of which ends the loop.
fn break_condition(inputs: &NodeInputs) -> Result<Option<Vec<ConditionGroup>>, NodeError> {
    match inputs.get(keys::LOOP_BREAK_CONDITION) {
        None => Ok(None),
        Some(Value::Array(items)) if items.is_empty() => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(vec![serde_json::from_value(value.clone())?])),
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
    }
}

fn should_break(groups: &[ConditionGroup], pool: &VariablePool) -> bool {
    groups.iter().any(|group| evaluate_group(group, pool))
}

pub struct LoopNodeExecutor;

#[async_trait]
impl NodeExecutor for LoopNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let items: Option<Vec<Value>> = node
            .input(keys::LOOP_INPUT_ARRAY)
            .map(|_| inputs.array(keys::LOOP_INPUT_ARRAY).to_vec());
        let breaker = break_condition(inputs)?;
        if items.is_none() && breaker.is_none() {
            return Err(NodeError::ConfigError(
                "loop needs an input array or a break condition".to_string(),
            ));
        }

        let end_nodes: Vec<&Node> = ctx
            .graph
            .nodes()
            .iter()
            .filter(|n| {
                n.node_type == NodeType::LoopEnd && n.parent_node_id.as_deref() == Some(node.id.as_str())
            })
            .collect();

        let mut collected = Vec::new();
        let mut children = Vec::new();
        let mut answers = Vec::new();
        let mut halt = None;
        let mut iteration: usize = 0;

        loop {
            let item = match &items {
                Some(items) if iteration >= items.len() => break,
                Some(items) => items[iteration].clone(),
                None => Value::Null,
            };
            if let Err(error) = ctx.run.budget.consume_loop() {
                tracing::warn!(node_id = %node.id, iteration, "loop budget exhausted");
                halt = Some(error);
                break;
            }

            let params = HashMap::from([
                (keys::LOOP_START_INPUT.to_string(), item),
                (
                    keys::LOOP_START_INDEX.to_string(),
                    Value::from(iteration as u64 + 1),
                ),
            ]);
            let request = SubGraphRequest::new(
                Arc::clone(ctx.graph),
                ctx.pool
                    .fork_overlay(OverlayKind::LoopIteration(iteration as u32)),
                ctx.run.clone(),
            )
            .in_scope(node.id.clone())
            .with_params(params);

            let nested =
                match run_sub_graph(ctx.env.clone(), ctx.emitter.nested(&node.id), request).await {
                    Ok(nested) => nested,
                    Err(e) => {
                        halt = Some(NodeError::SubWorkflowError(e.to_string()));
                        break;
                    }
                };
            if let Err(error) = reject_pause(&nested.outcome) {
                halt = Some(error);
                break;
            }
            tracing::debug!(node_id = %node.id, iteration, "loop iteration finished");

            match nested.outcome {
                RunOutcome::Completed(response) => {
                    for end in &end_nodes {
                        if let Some(value) = response.output(&end.id, keys::LOOP_END_INPUT) {
                            collected.push(value.clone());
                        }
                    }
                    if !response.final_answer.is_empty() {
                        answers.push(response.final_answer);
                    }
                    children.extend(response.usage);
                }
                // Iterations that already ran stay billed.
                RunOutcome::Failed { response, failure } => {
                    children.extend(response.usage);
                    halt = Some(failure.into_node_error());
                    break;
                }
                // Already turned into `halt` by `reject_pause`.
                RunOutcome::Paused { .. } => break,
            }

            iteration += 1;
            if let Some(groups) = &breaker {
                if should_break(groups, &nested.pool) {
                    break;
                }
            }
        }

        let mut result =
            NodeRunResult::default().output(keys::LOOP_ARRAY, Value::Array(collected));
        result.children = children;
        result.halt = halt;
        if !answers.is_empty() {
            result.answer_text = Some(answers.concat());
        }
        Ok(result)
    }
}
