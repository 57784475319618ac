use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::core::snapshot::RunSnapshot;
use crate::core::usage::NodeExecutionRecord;
use crate::error::{BudgetKind, ErrorKind, NodeError};
use crate::nodes::InteractiveRequest;

/// What a run produced, however it ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    /// Answer text from answer nodes and responding chat nodes, concatenated.
    pub final_answer: String,
    /// Execution records in completion order.
    pub usage: Vec<NodeExecutionRecord>,
    pub total_points: f64,
    /// Outputs of every node completed in this dispatch.
    pub node_outputs: BTreeMap<String, BTreeMap<String, Value>>,
    pub variables: BTreeMap<String, Value>,
    pub completed_node_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,
    /// A stop node ended the dispatch early.
    pub stopped: bool,
}

impl RunResponse {
    pub fn output(&self, node_id: &str, key: &str) -> Option<&Value> {
        self.node_outputs.get(node_id).and_then(|o| o.get(key))
    }

    /// Ids of nodes that appear in the usage records, in order.
    pub fn recorded_node_ids(&self) -> Vec<&str> {
        self.usage.iter().map(|r| r.node_id.as_str()).collect()
    }
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip)]
    budget: Option<(BudgetKind, u32)>,
}

impl RunFailure {
    pub fn from_node_error(error: &NodeError, node_id: Option<String>) -> Self {
        let (kind, budget) = match error {
            NodeError::BudgetExceeded { kind, limit } => {
                (ErrorKind::BudgetExceeded, Some((*kind, *limit)))
            }
            NodeError::Timeout => (ErrorKind::Timeout, None),
            NodeError::Cancelled => (ErrorKind::Cancelled, None),
            _ => (ErrorKind::NodeExecution, None),
        };
        Self {
            kind,
            message: error.to_string(),
            node_id,
            budget,
        }
    }

    /// Error a nested dispatch reports to the node that owns it. Run-control
    /// failures keep their kind so the outer run aborts the same way.
    pub fn into_node_error(self) -> NodeError {
        match (self.kind, self.budget) {
            (ErrorKind::BudgetExceeded, Some((kind, limit))) => {
                NodeError::BudgetExceeded { kind, limit }
            }
            (ErrorKind::Timeout, _) => NodeError::Timeout,
            (ErrorKind::Cancelled, _) => NodeError::Cancelled,
            _ => NodeError::SubWorkflowError(match self.node_id {
                Some(id) => format!("node '{}': {}", id, self.message),
                None => self.message,
            }),
        }
    }
}

/// Terminal state of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunResponse),
    /// Waiting for a user reply. Resume with the snapshot.
    Paused {
        response: RunResponse,
        interactive: InteractiveRequest,
        snapshot: Box<RunSnapshot>,
    },
    /// Aborted after dispatch started. The response holds everything
    /// produced before the failure.
    Failed {
        response: RunResponse,
        failure: RunFailure,
    },
}

impl RunOutcome {
    pub fn response(&self) -> &RunResponse {
        match self {
            RunOutcome::Completed(response)
            | RunOutcome::Paused { response, .. }
            | RunOutcome::Failed { response, .. } => response,
        }
    }

    pub fn into_response(self) -> RunResponse {
        match self {
            RunOutcome::Completed(response)
            | RunOutcome::Paused { response, .. }
            | RunOutcome::Failed { response, .. } => response,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match self {
            RunOutcome::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Option<&RunSnapshot> {
        match self {
            RunOutcome::Paused { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_failure_round_trips_to_node_error() {
        let error = NodeError::BudgetExceeded {
            kind: BudgetKind::LoopTimes,
            limit: 3,
        };
        let failure = RunFailure::from_node_error(&error, Some("loop".into()));
        assert_eq!(failure.kind, ErrorKind::BudgetExceeded);
        assert!(matches!(
            failure.into_node_error(),
            NodeError::BudgetExceeded {
                kind: BudgetKind::LoopTimes,
                limit: 3
            }
        ));
    }

    #[test]
    fn test_ordinary_failure_becomes_sub_workflow_error() {
        let failure = RunFailure::from_node_error(
            &NodeError::ExecutionError("boom".into()),
            Some("n1".into()),
        );
        assert_eq!(failure.kind, ErrorKind::NodeExecution);
        let err = failure.into_node_error();
        assert!(matches!(err, NodeError::SubWorkflowError(msg) if msg.contains("n1")));
    }
}
