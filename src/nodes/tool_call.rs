//! Tool-call node: lets the model call the nodes attached to its
//! `selectedTools` handle, each call running as a nested dispatch that starts
//! at the tool node.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{ChatMessage, ToolCall, ToolSpec};
use crate::core::outcome::{RunOutcome, RunResponse};
use crate::core::sub_graph_runner::{reject_pause, run_sub_graph, SubGraphRequest};
use crate::core::usage::{NodeExecutionRecord, UsageDelta};
use crate::core::variable_pool::OverlayKind;
use crate::error::NodeError;
use crate::graph::Node;
use crate::nodes::executor::{NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::llm::{build_messages, chat_request, stream_completion};
use crate::nodes::node_type::keys;
use crate::template::value_to_text;

/// Function spec for a tool node. Parameters are the inputs carrying a tool
/// description.
pub fn tool_spec(node: &Node) -> ToolSpec {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for input in &node.inputs {
        let Some(description) = &input.tool_description else {
            continue;
        };
        properties.insert(
            input.key.clone(),
            json!({ "type": input.value_type.json_schema_type(), "description": description }),
        );
        if input.required {
            required.push(Value::String(input.key.clone()));
        }
    }
    ToolSpec {
        name: node.id.clone(),
        description: node
            .tool_description
            .clone()
            .unwrap_or_else(|| node.display_name().to_string()),
        parameters: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

/// What a finished tool dispatch hands back to the model.
fn tool_result_text(tool_id: &str, response: &RunResponse) -> String {
    if let Some(value) = &response.tool_response {
        return value_to_text(value);
    }
    if !response.final_answer.is_empty() {
        return response.final_answer.clone();
    }
    response
        .node_outputs
        .get(tool_id)
        .and_then(|outputs| serde_json::to_string(outputs).ok())
        .unwrap_or_default()
}

/// Result of one tool invocation.
enum ToolRun {
    Done { text: String, stopped: bool },
    /// The tool dispatch could not finish. Budget, deadline and cancellation
    /// land here, as do nested dispatch errors.
    Halted(NodeError),
}

pub struct ToolCallExecutor;

impl ToolCallExecutor {
    async fn call_tool(
        &self,
        owner: &Node,
        tool: &Node,
        call: &ToolCall,
        ctx: &NodeContext<'_>,
        children: &mut Vec<NodeExecutionRecord>,
        answers: &mut Vec<String>,
    ) -> Result<ToolRun, NodeError> {
        let params: HashMap<String, Value> = match call.parsed_arguments() {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        tracing::debug!(node_id = %owner.id, tool = %tool.id, "calling tool");

        let mut request = SubGraphRequest::new(
            Arc::clone(ctx.graph),
            ctx.pool.fork_overlay(OverlayKind::ToolCall),
            ctx.run.clone(),
        )
        .starting_at(vec![tool.id.clone()])
        .with_params(params);
        request.scope = tool.parent_node_id.clone();

        let nested = run_sub_graph(ctx.env.clone(), ctx.emitter.nested(&owner.id), request)
            .await
            .map_err(|e| NodeError::SubWorkflowError(e.to_string()))?;
        reject_pause(&nested.outcome)?;

        match nested.outcome {
            RunOutcome::Completed(response) => {
                let text = tool_result_text(&tool.id, &response);
                if !response.final_answer.is_empty() {
                    answers.push(response.final_answer.clone());
                }
                children.extend(response.usage);
                Ok(ToolRun::Done {
                    text,
                    stopped: response.stopped,
                })
            }
            RunOutcome::Failed { response, failure } => {
                children.extend(response.usage);
                let error = failure.into_node_error();
                if error.is_run_control() {
                    return Ok(ToolRun::Halted(error));
                }
                // The model sees the failure and may recover.
                tracing::warn!(node_id = %owner.id, tool = %tool.id, error = %error, "tool failed");
                Ok(ToolRun::Done {
                    text: error.to_string(),
                    stopped: false,
                })
            }
            RunOutcome::Paused { .. } => Err(NodeError::ExecutionError(
                "tool dispatch paused".to_string(),
            )),
        }
    }
}

#[async_trait]
impl NodeExecutor for ToolCallExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let model = inputs.require_str(keys::MODEL)?.to_string();
        let respond = inputs.bool_or(keys::IS_RESPONSE_ANSWER_TEXT, true);
        let index = ctx
            .graph
            .index_of(&node.id)
            .ok_or_else(|| NodeError::ConfigError(format!("node '{}' not in graph", node.id)))?;
        let tools = ctx.graph.tool_targets(index);
        let specs: Vec<ToolSpec> = tools.iter().copied().map(tool_spec).collect();

        let mut messages = build_messages(inputs, ctx)?;
        let mut usage: Vec<UsageDelta> = Vec::new();
        let mut children: Vec<NodeExecutionRecord> = Vec::new();
        let mut answers: Vec<String> = Vec::new();
        let mut content = String::new();
        let mut halt = None;
        let max_rounds = ctx.env.config.max_tool_rounds.max(1);

        'rounds: for round in 1..=max_rounds {
            let mut request = chat_request(inputs, messages.clone());
            request.tools = specs.clone();
            let output = match stream_completion(ctx, &node.id, request, respond).await {
                Ok(output) => output,
                Err(broken) => {
                    usage.push(UsageDelta::priced(
                        &model,
                        broken.usage,
                        &ctx.env.capabilities.pricing,
                    ));
                    halt = Some(broken.error);
                    break;
                }
            };
            usage.push(UsageDelta::priced(
                &model,
                output.usage,
                &ctx.env.capabilities.pricing,
            ));
            content = output.content.clone();
            if output.tool_calls.is_empty() {
                break;
            }
            if round == max_rounds {
                tracing::warn!(node_id = %node.id, rounds = max_rounds, "tool round limit reached");
                break;
            }

            messages.push(ChatMessage {
                tool_calls: output.tool_calls.clone(),
                ..ChatMessage::assistant(output.content)
            });
            for call in &output.tool_calls {
                let Some(tool) = tools.iter().find(|t| t.id == call.name) else {
                    messages.push(ChatMessage::tool_result(
                        &call.id,
                        format!("unknown tool '{}'", call.name),
                    ));
                    continue;
                };
                let run = self
                    .call_tool(node, tool, call, ctx, &mut children, &mut answers)
                    .await
                    .unwrap_or_else(ToolRun::Halted);
                match run {
                    ToolRun::Done { text, stopped } => {
                        messages.push(ChatMessage::tool_result(&call.id, text));
                        if stopped {
                            tracing::debug!(node_id = %node.id, tool = %tool.id, "tool stopped the loop");
                            content.clear();
                            break 'rounds;
                        }
                    }
                    ToolRun::Halted(error) => {
                        halt = Some(error);
                        break 'rounds;
                    }
                }
            }
        }

        answers.push(content.clone());
        let answer: String = answers.concat();
        let mut result =
            NodeRunResult::default().output(keys::ANSWER_TEXT, Value::String(content));
        result.usage = usage;
        result.children = children;
        result.halt = halt;
        if respond {
            result.answer_text = Some(answer);
        }
        Ok(result)
    }
}
