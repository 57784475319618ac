use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::snapshot::RunSnapshot;
use crate::core::usage::NodeExecutionRecord;
use crate::error::ErrorKind;
use crate::nodes::{InteractiveRequest, NodeType};

/// Events streamed to the caller while a run progresses, in causal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    NodeStart {
        node_id: String,
        node_type: NodeType,
        name: String,
    },
    /// Incremental text produced by a node, in generation order.
    NodeStream { node_id: String, delta: String },
    NodeFinish {
        node_id: String,
        outputs: BTreeMap<String, Value>,
    },
    /// The run stopped at an interactive node and can be resumed from `snapshot`.
    RunPause {
        interactive: InteractiveRequest,
        snapshot: Box<RunSnapshot>,
    },
    RunFinish {
        final_answer: String,
        usage: Vec<NodeExecutionRecord>,
        total_points: f64,
    },
    RunError {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        partial_usage: Vec<NodeExecutionRecord>,
    },
}

/// Sends [`RunEvent`]s to the caller's channel.
///
/// A nested emitter (loop bodies, tool calls, sub-workflows) forwards only
/// stream deltas, re-attributed to the node that owns the nested dispatch.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<RunEvent>>,
    active: Arc<AtomicBool>,
    attribute_to: Option<String>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self {
            tx: Some(tx),
            active: Arc::new(AtomicBool::new(true)),
            attribute_to: None,
        }
    }

    /// Emitter that drops every event.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            active: Arc::new(AtomicBool::new(false)),
            attribute_to: None,
        }
    }

    /// Emitter for a dispatch nested under `node_id`. Nesting keeps the
    /// outermost attribution.
    pub fn nested(&self, node_id: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            active: Arc::clone(&self.active),
            attribute_to: Some(
                self.attribute_to
                    .clone()
                    .unwrap_or_else(|| node_id.to_string()),
            ),
        }
    }

    #[inline(always)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_nested(&self) -> bool {
        self.attribute_to.is_some()
    }

    /// True once the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(false)
    }

    pub async fn emit(&self, event: RunEvent) {
        if !self.is_active() {
            return;
        }
        let Some(tx) = &self.tx else {
            return;
        };
        let event = match (&self.attribute_to, event) {
            (None, event) => event,
            (Some(owner), RunEvent::NodeStream { delta, .. }) => RunEvent::NodeStream {
                node_id: owner.clone(),
                delta,
            },
            (Some(_), _) => return,
        };
        if tx.send(event).await.is_err() {
            self.active.store(false, Ordering::Relaxed);
        }
    }

    pub async fn stream(&self, node_id: &str, delta: impl Into<String>) {
        self.emit(RunEvent::NodeStream {
            node_id: node_id.to_string(),
            delta: delta.into(),
        })
        .await;
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("active", &self.is_active())
            .field("attribute_to", &self.attribute_to)
            .finish()
    }
}
