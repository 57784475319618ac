//! Workflow-level error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ErrorKind, NodeError};

/// Which run budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    RunTimes,
    LoopTimes,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetKind::RunTimes => f.write_str("run_times"),
            BudgetKind::LoopTimes => f.write_str("loop_times"),
        }
    }
}

/// Workflow-level errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("DSL parse error: {0}")]
    DslParseError(String),
    #[error("Graph validation error: {0}")]
    GraphValidationError(String),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Node executor not found for type: {0}")]
    ExecutorNotFound(String),
    #[error("No entry node found")]
    NoEntryNode,
    #[error("Missing required variable: {0}")]
    MissingVariable(String),
    #[error("Budget exceeded: {kind} limit {limit}")]
    BudgetExceeded { kind: BudgetKind, limit: u32 },
    #[error("Execution timeout")]
    ExecutionTimeout,
    #[error("Run cancelled: event consumer closed")]
    Cancelled,
    #[error("Node execution error: node={node_id}, error={error}")]
    NodeExecutionError { node_id: String, error: String },
    #[error("Snapshot mismatch: {0}")]
    SnapshotMismatch(String),
    #[error("Node error: {0}")]
    NodeError(Box<NodeError>),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl WorkflowError {
    /// Stable classification used for `run-error` events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::DslParseError(_)
            | WorkflowError::GraphValidationError(_)
            | WorkflowError::NodeNotFound(_)
            | WorkflowError::ExecutorNotFound(_)
            | WorkflowError::NoEntryNode
            | WorkflowError::MissingVariable(_)
            | WorkflowError::SnapshotMismatch(_) => ErrorKind::Validation,
            WorkflowError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            WorkflowError::ExecutionTimeout => ErrorKind::Timeout,
            WorkflowError::Cancelled => ErrorKind::Cancelled,
            WorkflowError::NodeExecutionError { .. } => ErrorKind::NodeExecution,
            WorkflowError::NodeError(inner) => match inner.as_ref() {
                NodeError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
                NodeError::Timeout => ErrorKind::Timeout,
                NodeError::Cancelled => ErrorKind::Cancelled,
                _ => ErrorKind::NodeExecution,
            },
            WorkflowError::InternalError(_) => ErrorKind::Internal,
        }
    }
}

impl From<NodeError> for WorkflowError {
    fn from(value: NodeError) -> Self {
        match value {
            NodeError::BudgetExceeded { kind, limit } => WorkflowError::BudgetExceeded { kind, limit },
            NodeError::Timeout => WorkflowError::ExecutionTimeout,
            NodeError::Cancelled => WorkflowError::Cancelled,
            other => WorkflowError::NodeError(Box::new(other)),
        }
    }
}
