use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::NodeError;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Script error: {0}")]
    ScriptError(String),
    #[error("Execution timed out")]
    ExecutionTimeout,
    #[error("Code sandbox is not configured")]
    Unavailable,
}

impl From<SandboxError> for NodeError {
    fn from(e: SandboxError) -> Self {
        NodeError::SandboxError(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    #[default]
    #[serde(alias = "javascript")]
    Js,
    #[serde(alias = "python3", alias = "python")]
    Py,
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub code: String,
    pub language: CodeLanguage,
    /// Inputs exposed to the script by name.
    pub variables: Map<String, Value>,
}

/// Runs user code out of process. The result must be a JSON object.
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<Map<String, Value>, SandboxError>;
}
