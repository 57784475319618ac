//! Chat-completion capability: message types, the streaming trait, and the
//! accumulator that folds a chunk stream into a final completion.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::NodeError;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Model not supported: {0}")]
    ModelNotSupported(String),

    #[error("Rate limit exceeded: retry after {retry_after:?}s")]
    RateLimitExceeded { retry_after: Option<u64> },

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Chat capability is not configured")]
    Unavailable,
}

impl From<LlmError> for NodeError {
    fn from(e: LlmError) -> Self {
        NodeError::LlmError(e.to_string())
    }
}

/// Role of a chat message participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool call requested by the model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    /// Tool name; the id of the tool node it targets.
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

impl ToolCall {
    /// Parsed arguments. Malformed or empty arguments become an empty object.
    pub fn parsed_arguments(&self) -> Value {
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::Object(Default::default()),
        }
    }
}

/// Tool exposed to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
    /// Tool calls made by assistant (only present when role=Assistant).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Correlates tool result with its call (only present when role=Tool).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Fragment of a tool call as streamed by the provider. Fragments sharing an
/// `index` belong to the same call; `arguments` pieces are concatenated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// One chunk of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    /// Usage is usually reported once, on the last chunk.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ChatChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            ..Default::default()
        }
    }
}

pub type ChatStream = BoxStream<'static, Result<ChatChunk, LlmError>>;

/// Streaming chat completion.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError>;
}

/// Completed model turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletionOutput {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

/// Folds chunks into a [`ChatCompletionOutput`].
#[derive(Debug, Default)]
pub struct ChatAccumulator {
    content: String,
    calls: Vec<ToolCallDelta>,
    usage: TokenUsage,
}

impl ChatAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk and returns its text delta, if any.
    pub fn push(&mut self, chunk: ChatChunk) -> Option<String> {
        for part in chunk.tool_calls {
            match self.calls.iter_mut().find(|c| c.index == part.index) {
                Some(call) => {
                    if part.id.is_some() {
                        call.id = part.id;
                    }
                    if part.name.is_some() {
                        call.name = part.name;
                    }
                    call.arguments.push_str(&part.arguments);
                }
                None => self.calls.push(part),
            }
        }
        if let Some(usage) = chunk.usage {
            self.usage = usage;
        }
        if chunk.delta.is_empty() {
            return None;
        }
        self.content.push_str(&chunk.delta);
        Some(chunk.delta)
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn finish(mut self) -> ChatCompletionOutput {
        self.calls.sort_by_key(|c| c.index);
        let tool_calls = self
            .calls
            .into_iter()
            .filter_map(|c| {
                let name = c.name?;
                Some(ToolCall {
                    id: c.id.unwrap_or_else(|| format!("call_{}", c.index)),
                    name,
                    arguments: c.arguments,
                })
            })
            .collect();
        ChatCompletionOutput {
            content: self.content,
            tool_calls,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_role_serde() {
        let json = serde_json::to_string(&ChatRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let role: ChatRole = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(role, ChatRole::Tool);
    }

    #[test]
    fn test_accumulator_concatenates_text() {
        let mut acc = ChatAccumulator::new();
        assert_eq!(acc.push(ChatChunk::text("hel")), Some("hel".to_string()));
        assert_eq!(acc.push(ChatChunk::text("lo")), Some("lo".to_string()));
        assert_eq!(
            acc.push(ChatChunk {
                usage: Some(TokenUsage {
                    input_tokens: 3,
                    output_tokens: 2
                }),
                ..Default::default()
            }),
            None
        );
        let out = acc.finish();
        assert_eq!(out.content, "hello");
        assert_eq!(out.usage.total(), 5);
        assert!(out.tool_calls.is_empty());
    }

    #[test]
    fn test_accumulator_assembles_tool_call_fragments() {
        let mut acc = ChatAccumulator::new();
        acc.push(ChatChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("search".into()),
                arguments: "{\"q\":".into(),
            }],
            ..Default::default()
        });
        acc.push(ChatChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                arguments: "\"rust\"}".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let out = acc.finish();
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "search");
        assert_eq!(out.tool_calls[0].parsed_arguments()["q"], "rust");
    }

    #[test]
    fn test_malformed_arguments_parse_to_empty_object() {
        let call = ToolCall {
            id: "c".into(),
            name: "t".into(),
            arguments: "{oops".into(),
        };
        assert_eq!(call.parsed_arguments(), serde_json::json!({}));
    }
}
