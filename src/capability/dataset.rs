use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::chat::TokenUsage;
use crate::error::NodeError;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset not found: {0}")]
    NotFound(String),
    #[error("Search failed: {0}")]
    SearchFailed(String),
    #[error("Dataset capability is not configured")]
    Unavailable,
}

impl From<DatasetError> for NodeError {
    fn from(e: DatasetError) -> Self {
        NodeError::DatasetError(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub dataset_ids: Vec<String>,
    pub limit: u32,
    pub similarity: f64,
    #[serde(default)]
    pub filters: Value,
}

/// Retrieved chunk, as stored in `quoteQA` outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredChunk {
    pub id: String,
    #[serde(default)]
    pub dataset_id: String,
    pub content: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub chunks: Vec<ScoredChunk>,
    /// Embedding model billed for the query, if any.
    pub model: Option<String>,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait DatasetSearch: Send + Sync {
    async fn search(&self, request: SearchRequest) -> Result<SearchResponse, DatasetError>;
}
