//! Chat-model nodes: plain chat and question classification, plus the
//! message-building and streaming helpers shared with the tool-call node.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::capability::{
    ChatAccumulator, ChatCompletionOutput, ChatMessage, ChatRequest, ChatRole, ScoredChunk,
    TokenUsage,
};
use crate::core::usage::UsageDelta;
use crate::error::NodeError;
use crate::graph::Node;
use crate::nodes::executor::{EdgeRouting, NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::keys;

const QUOTE_PROMPT_HEADER: &str =
    "Use the content inside <Quotes></Quotes> as your knowledge when answering.";

const CLASSIFY_PROMPT: &str = "Classify the user's question into exactly one of the categories \
below. Reply with the category id only.";

/// Chat history for a model call. A number selects the last N rounds of the
/// run's history, an array is used as-is, and nothing selects the configured
/// default window.
pub(crate) fn collect_history(inputs: &NodeInputs, ctx: &NodeContext<'_>) -> Vec<ChatMessage> {
    let rounds = match inputs.get(keys::HISTORY) {
        Some(Value::Array(items)) => {
            return items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect();
        }
        Some(value) => usize::try_from(value.as_u64().unwrap_or(0)).unwrap_or(usize::MAX),
        None => ctx.env.config.history_limit as usize,
    };
    last_rounds(ctx.run.history.as_slice(), rounds).to_vec()
}

/// The last `rounds` question/answer pairs of `history`.
fn last_rounds(history: &[ChatMessage], rounds: usize) -> &[ChatMessage] {
    let keep = rounds.saturating_mul(2).min(history.len());
    &history[history.len() - keep..]
}

fn quote_prompt(quotes: &[ScoredChunk]) -> Option<String> {
    if quotes.is_empty() {
        return None;
    }
    let body: Vec<String> = quotes
        .iter()
        .map(|q| format!("<Quote id=\"{}\">\n{}\n</Quote>", q.id, q.content))
        .collect();
    Some(format!(
        "{}\n<Quotes>\n{}\n</Quotes>",
        QUOTE_PROMPT_HEADER,
        body.join("\n")
    ))
}

/// System prompt, quotes, history and the user's question, in that order.
pub(crate) fn build_messages(
    inputs: &NodeInputs,
    ctx: &NodeContext<'_>,
) -> Result<Vec<ChatMessage>, NodeError> {
    let mut messages = Vec::new();
    let system = inputs.str(keys::SYSTEM_PROMPT);
    if !system.is_empty() {
        messages.push(ChatMessage::system(system));
    }
    let quotes: Vec<ScoredChunk> = match inputs.get(keys::QUOTE_QA) {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Vec::new(),
    };
    if let Some(prompt) = quote_prompt(&quotes) {
        messages.push(ChatMessage::system(prompt));
    }
    messages.extend(collect_history(inputs, ctx));
    messages.push(ChatMessage::user(inputs.require_str(keys::USER_CHAT_INPUT)?));
    Ok(messages)
}

pub(crate) fn chat_request(inputs: &NodeInputs, messages: Vec<ChatMessage>) -> ChatRequest {
    ChatRequest {
        model: inputs.str(keys::MODEL).to_string(),
        messages,
        tools: Vec::new(),
        temperature: inputs.f64(keys::TEMPERATURE),
        max_tokens: inputs.u64(keys::MAX_TOKEN).map(|n| n as u32),
    }
}

/// A completion that broke off, with the tokens reported before it did.
pub(crate) struct BrokenCompletion {
    pub error: NodeError,
    pub usage: TokenUsage,
}

impl BrokenCompletion {
    /// Failed result that still bills the tokens already used.
    pub fn into_result(self, model: &str, ctx: &NodeContext<'_>) -> NodeRunResult {
        let mut result = NodeRunResult::default();
        result.usage.push(UsageDelta::priced(
            model,
            self.usage,
            &ctx.env.capabilities.pricing,
        ));
        result.halt = Some(self.error);
        result
    }
}

/// Runs one streamed completion. Text deltas are forwarded in generation
/// order when `forward` is set.
pub(crate) async fn stream_completion(
    ctx: &NodeContext<'_>,
    node_id: &str,
    request: ChatRequest,
    forward: bool,
) -> Result<ChatCompletionOutput, BrokenCompletion> {
    let mut stream = match ctx.env.capabilities.chat.stream(request).await {
        Ok(stream) => stream,
        Err(error) => {
            return Err(BrokenCompletion {
                error: error.into(),
                usage: TokenUsage::default(),
            })
        }
    };
    let mut acc = ChatAccumulator::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                return Err(BrokenCompletion {
                    error: error.into(),
                    usage: acc.usage(),
                })
            }
        };
        if let Some(delta) = acc.push(chunk) {
            if forward {
                ctx.emitter.stream(node_id, delta).await;
            }
        }
    }
    Ok(acc.finish())
}

// ================================
// Chat Node
// ================================

pub struct ChatNodeExecutor;

#[async_trait]
impl NodeExecutor for ChatNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let model = inputs.require_str(keys::MODEL)?.to_string();
        let respond = inputs.bool_or(keys::IS_RESPONSE_ANSWER_TEXT, true);
        let messages = build_messages(inputs, ctx)?;
        let request = chat_request(inputs, messages.clone());

        let output = match stream_completion(ctx, &node.id, request, respond).await {
            Ok(output) => output,
            Err(broken) => return Ok(broken.into_result(&model, ctx)),
        };
        tracing::debug!(
            node_id = %node.id,
            model = %model,
            tokens = output.usage.total(),
            "chat completed"
        );

        let mut history: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|m| m.role != ChatRole::System)
            .collect();
        history.push(ChatMessage::assistant(output.content.clone()));

        let mut result = NodeRunResult::default()
            .output(keys::ANSWER_TEXT, Value::String(output.content.clone()))
            .output(keys::HISTORY, serde_json::to_value(history)?);
        result.usage.push(UsageDelta::priced(
            &model,
            output.usage,
            &ctx.env.capabilities.pricing,
        ));
        if respond {
            result.answer_text = Some(output.content);
        }
        Ok(result)
    }
}

// ================================
// Classify Question Node
// ================================

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyAgent {
    /// Source handle of this category.
    pub key: String,
    /// Category description shown to the model.
    #[serde(default)]
    pub value: String,
}

pub struct ClassifyQuestionExecutor;

#[async_trait]
impl NodeExecutor for ClassifyQuestionExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let model = inputs.require_str(keys::MODEL)?.to_string();
        let agents: Vec<ClassifyAgent> = inputs.parse(keys::AGENTS)?;
        if agents.is_empty() {
            return Err(NodeError::ConfigError("no categories configured".to_string()));
        }

        let catalogue: Vec<String> = agents
            .iter()
            .map(|a| format!("{}: {}", a.key, a.value))
            .collect();
        let mut messages = vec![ChatMessage::system(format!(
            "{}\n{}\n{}",
            CLASSIFY_PROMPT,
            inputs.str(keys::SYSTEM_PROMPT),
            catalogue.join("\n")
        ))];
        messages.extend(collect_history(inputs, ctx));
        messages.push(ChatMessage::user(inputs.require_str(keys::USER_CHAT_INPUT)?));

        let output =
            match stream_completion(ctx, &node.id, chat_request(inputs, messages), false).await {
                Ok(output) => output,
                Err(broken) => return Ok(broken.into_result(&model, ctx)),
            };
        let chosen = pick_category(&agents, &output.content);
        tracing::debug!(node_id = %node.id, category = %chosen.key, "question classified");

        let mut result = NodeRunResult::default()
            .output(keys::CQ_RESULT, Value::String(chosen.value.clone()))
            .routed(EdgeRouting::Only(chosen.key.clone()));
        result.usage.push(UsageDelta::priced(
            &model,
            output.usage,
            &ctx.env.capabilities.pricing,
        ));
        Ok(result)
    }
}

/// Category named by the model's reply. Falls back to the last category.
fn pick_category<'a>(agents: &'a [ClassifyAgent], reply: &str) -> &'a ClassifyAgent {
    let reply = reply.trim();
    agents
        .iter()
        .find(|a| a.key == reply)
        .or_else(|| agents.iter().find(|a| !a.value.is_empty() && a.value == reply))
        .or_else(|| agents.iter().find(|a| reply.contains(a.key.as_str())))
        .unwrap_or(&agents[agents.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents() -> Vec<ClassifyAgent> {
        vec![
            ClassifyAgent {
                key: "greet".into(),
                value: "Greetings".into(),
            },
            ClassifyAgent {
                key: "other".into(),
                value: "Anything else".into(),
            },
        ]
    }

    #[test]
    fn test_pick_category() {
        let agents = agents();
        assert_eq!(pick_category(&agents, " greet\n").key, "greet");
        assert_eq!(pick_category(&agents, "Greetings").key, "greet");
        assert_eq!(pick_category(&agents, "category: greet").key, "greet");
        assert_eq!(pick_category(&agents, "no idea").key, "other");
    }

    #[test]
    fn test_last_rounds() {
        let history: Vec<ChatMessage> = (0..6)
            .map(|i| ChatMessage::user(format!("m{}", i)))
            .collect();
        assert!(last_rounds(&history, 0).is_empty());
        assert_eq!(last_rounds(&history, 1)[0].content, "m4");
        assert_eq!(last_rounds(&history, 10).len(), 6);
        assert_eq!(last_rounds(&history, usize::MAX).len(), 6);
    }

    #[test]
    fn test_quote_prompt() {
        assert!(quote_prompt(&[]).is_none());
        let prompt = quote_prompt(&[ScoredChunk {
            id: "q1".into(),
            dataset_id: String::new(),
            content: "fact".into(),
            source_name: String::new(),
            score: 1.0,
        }])
        .unwrap();
        assert!(prompt.contains("<Quote id=\"q1\">\nfact\n</Quote>"));
    }
}
