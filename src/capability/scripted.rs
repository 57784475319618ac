//! In-process capability implementations: scripted responses for tests and the
//! CLI, and `Unavailable` for capabilities a deployment does not provide.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::chat::{ChatChunk, ChatCompletion, ChatRequest, ChatRole, ChatStream, LlmError, TokenUsage};
use super::dataset::{DatasetError, DatasetSearch, ScoredChunk, SearchRequest, SearchResponse};
use super::http::{HttpError, HttpRequest, HttpRequester, HttpResponse};
use super::sandbox::{CodeSandbox, SandboxError, SandboxRequest};

/// Chat model replaying queued turns. When the queue is empty it echoes the
/// last user message back word by word.
#[derive(Default)]
pub struct ScriptedChat {
    turns: Mutex<VecDeque<Vec<Result<ChatChunk, LlmError>>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one model turn as a sequence of chunks.
    pub fn with_turn(self, chunks: Vec<ChatChunk>) -> Self {
        self.turns.lock().push_back(chunks.into_iter().map(Ok).collect());
        self
    }

    /// Queues a turn streaming `text` in one chunk, followed by a usage chunk.
    pub fn with_reply(self, text: &str, usage: TokenUsage) -> Self {
        self.with_turn(vec![
            ChatChunk::text(text),
            ChatChunk {
                usage: Some(usage),
                ..Default::default()
            },
        ])
    }

    /// Queues a turn that fails mid-stream after the given chunks.
    pub fn with_failing_turn(self, chunks: Vec<ChatChunk>, error: LlmError) -> Self {
        let mut turn: Vec<_> = chunks.into_iter().map(Ok).collect();
        turn.push(Err(error));
        self.turns.lock().push_back(turn);
        self
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatCompletion for ScriptedChat {
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        let turn = self.turns.lock().pop_front();
        let chunks = match turn {
            Some(chunks) => chunks,
            None => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == ChatRole::User)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                let mut chunks: Vec<Result<ChatChunk, LlmError>> = last_user
                    .split_inclusive(' ')
                    .map(|word| Ok(ChatChunk::text(word)))
                    .collect();
                let words = chunks.len() as u64;
                chunks.push(Ok(ChatChunk {
                    usage: Some(TokenUsage {
                        input_tokens: words,
                        output_tokens: words,
                    }),
                    ..Default::default()
                }));
                chunks
            }
        };
        self.requests.lock().push(request);
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Dataset returning the same chunks for every query.
#[derive(Debug, Default, Clone)]
pub struct StaticDataset {
    pub chunks: Vec<ScoredChunk>,
    pub model: Option<String>,
    pub usage: TokenUsage,
}

impl StaticDataset {
    pub fn new(chunks: Vec<ScoredChunk>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatasetSearch for StaticDataset {
    async fn search(&self, request: SearchRequest) -> Result<SearchResponse, DatasetError> {
        let chunks = self
            .chunks
            .iter()
            .filter(|c| c.score >= request.similarity)
            .take(request.limit as usize)
            .cloned()
            .collect();
        Ok(SearchResponse {
            chunks,
            model: self.model.clone(),
            usage: self.usage,
        })
    }
}

/// Placeholder for capabilities that are not configured. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

#[async_trait]
impl ChatCompletion for Unavailable {
    async fn stream(&self, _request: ChatRequest) -> Result<ChatStream, LlmError> {
        Err(LlmError::Unavailable)
    }
}

#[async_trait]
impl DatasetSearch for Unavailable {
    async fn search(&self, _request: SearchRequest) -> Result<SearchResponse, DatasetError> {
        Err(DatasetError::Unavailable)
    }
}

#[async_trait]
impl CodeSandbox for Unavailable {
    async fn run(&self, _request: SandboxRequest) -> Result<Map<String, Value>, SandboxError> {
        Err(SandboxError::Unavailable)
    }
}

#[async_trait]
impl HttpRequester for Unavailable {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, HttpError> {
        Err(HttpError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::chat::ChatMessage;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_scripted_chat_replays_then_echoes() {
        let chat = ScriptedChat::new().with_reply("first", TokenUsage::default());
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hello there")],
            ..Default::default()
        };

        let chunks: Vec<_> = chat.stream(req.clone()).await.unwrap().collect().await;
        assert_eq!(chunks[0].as_ref().unwrap().delta, "first");

        let chunks: Vec<_> = chat.stream(req).await.unwrap().collect().await;
        let text: String = chunks
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .map(|c| c.delta.as_str())
            .collect();
        assert_eq!(text, "hello there");
        assert_eq!(chat.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_static_dataset_applies_limit_and_similarity() {
        let chunk = |id: &str, score: f64| ScoredChunk {
            id: id.into(),
            dataset_id: "d".into(),
            content: id.into(),
            source_name: String::new(),
            score,
        };
        let ds = StaticDataset::new(vec![chunk("a", 0.9), chunk("b", 0.2), chunk("c", 0.8)]);
        let resp = ds
            .search(SearchRequest {
                query: "q".into(),
                dataset_ids: vec![],
                limit: 1,
                similarity: 0.5,
                filters: Value::Null,
            })
            .await
            .unwrap();
        assert_eq!(resp.chunks.len(), 1);
        assert_eq!(resp.chunks[0].id, "a");
    }

    #[tokio::test]
    async fn test_unavailable_fails() {
        assert!(matches!(
            DatasetSearch::search(
                &Unavailable,
                SearchRequest {
                    query: String::new(),
                    dataset_ids: vec![],
                    limit: 1,
                    similarity: 0.0,
                    filters: Value::Null
                }
            )
            .await,
            Err(DatasetError::Unavailable)
        ));
    }
}
