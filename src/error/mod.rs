//! Error types for the dispatch engine.
//!
//! - [`NodeError`]: errors raised while a single node executor runs.
//! - [`WorkflowError`]: run-level errors (validation, budgets, node failures).
//! - [`ErrorKind`]: the stable `kind` tag reported in `run-error` events.

pub mod error_kind;
pub mod node_error;
pub mod workflow_error;

pub use error_kind::ErrorKind;
pub use node_error::NodeError;
pub use workflow_error::{BudgetKind, WorkflowError};

/// Convenience alias for workflow-level results.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
/// Convenience alias for node-level results.
pub type NodeResult<T> = Result<T, NodeError>;
