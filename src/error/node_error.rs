use thiserror::Error;

use super::workflow_error::BudgetKind;

/// Node-level errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Input validation error: {0}")]
    InputValidationError(String),
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("LLM error: {0}")]
    LlmError(String),
    #[error("Dataset search error: {0}")]
    DatasetError(String),
    #[error("Sandbox error: {0}")]
    SandboxError(String),
    #[error("HTTP error: {0}")]
    HttpError(String),
    #[error("Sub-workflow error: {0}")]
    SubWorkflowError(String),
    #[error("Workflow depth limit {0} exceeded")]
    DepthExceeded(u32),
    #[error("Budget exceeded: {kind} limit {limit}")]
    BudgetExceeded { kind: BudgetKind, limit: u32 },
    #[error("Timeout: run deadline exceeded")]
    Timeout,
    #[error("Run cancelled")]
    Cancelled,
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl NodeError {
    /// Errors that must stop the whole run even when the node tolerates failures.
    pub fn is_run_control(&self) -> bool {
        matches!(
            self,
            NodeError::BudgetExceeded { .. } | NodeError::Timeout | NodeError::Cancelled
        )
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::SerializationError(e.to_string())
    }
}
