use serde::{Deserialize, Serialize};

/// Stable classification of a run failure.
///
/// This is the `kind` field carried by [`RunEvent::RunError`](crate::core::RunEvent)
/// and by [`RunFailure`](crate::core::RunFailure); its serialized form must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad graph or port reference, rejected before dispatch.
    Validation,
    /// An executor failed or an external capability returned an error.
    NodeExecution,
    /// `maxRunTimes` or `maxLoopTimes` exhausted.
    BudgetExceeded,
    /// The global run deadline passed between node dispatches.
    Timeout,
    /// The event consumer went away.
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NodeExecution => "node_execution",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Controlled aborts finalize the run with partial outputs instead of crashing it.
    pub fn is_controlled_abort(&self) -> bool {
        matches!(
            self,
            ErrorKind::BudgetExceeded | ErrorKind::Timeout | ErrorKind::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
