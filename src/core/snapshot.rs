use serde::{Deserialize, Serialize};

use crate::core::variable_pool::PoolSnapshot;
use crate::error::WorkflowError;
use crate::graph::{EdgeStatus, Graph};
use crate::nodes::InteractiveRequest;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Where a paused dispatch stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRunCursor {
    /// Interactive node waiting for a reply. Re-run first on resume.
    pub pending_node_id: String,
    /// Ready nodes queued behind the pending node.
    pub ready_queue: Vec<String>,
    /// Runtime status of every edge, by edge index.
    pub edge_status: Vec<EdgeStatus>,
    pub skipped_node_ids: Vec<String>,
}

/// Everything needed to resume a paused run against the same graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub version: u32,
    pub cursor: GraphRunCursor,
    pub variables: PoolSnapshot,
    pub completed_node_ids: Vec<String>,
    pub run_times: u32,
    pub loop_times: u32,
    pub interactive: InteractiveRequest,
}

impl RunSnapshot {
    pub fn to_json(&self) -> Result<String, WorkflowError> {
        serde_json::to_string(self).map_err(|e| WorkflowError::InternalError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, WorkflowError> {
        serde_json::from_str(text).map_err(|e| WorkflowError::SnapshotMismatch(e.to_string()))
    }

    /// Checks that the snapshot was taken from `graph`.
    pub fn validate_against(&self, graph: &Graph) -> Result<(), WorkflowError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(WorkflowError::SnapshotMismatch(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        if self.cursor.edge_status.len() != graph.edges().len() {
            return Err(WorkflowError::SnapshotMismatch(format!(
                "snapshot has {} edges, graph has {}",
                self.cursor.edge_status.len(),
                graph.edges().len()
            )));
        }
        let known = |id: &String| graph.node(id).is_some();
        let all_known = known(&self.cursor.pending_node_id)
            && self.cursor.ready_queue.iter().all(known)
            && self.completed_node_ids.iter().all(known);
        if !all_known {
            return Err(WorkflowError::SnapshotMismatch(
                "snapshot references nodes missing from the graph".to_string(),
            ));
        }
        Ok(())
    }
}
