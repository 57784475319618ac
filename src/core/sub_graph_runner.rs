//! Nested dispatch for container nodes (loop bodies, tool calls, plugin modules).
//!
//! A nested dispatch is an ordinary [`WorkflowDispatcher`] run over a scope of
//! a graph with its own pool view and an emitter that only forwards stream
//! deltas. Budgets and the deadline are shared with the owning run through the
//! [`RunContext`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::core::dispatcher::{DispatchEnv, WorkflowDispatcher};
use crate::core::event_bus::EventEmitter;
use crate::core::outcome::RunOutcome;
use crate::core::runtime_context::RunContext;
use crate::core::variable_pool::VariablePool;
use crate::error::{NodeError, WorkflowResult};
use crate::graph::Graph;

/// What to dispatch and where to start.
pub struct SubGraphRequest {
    pub graph: Arc<Graph>,
    /// Container whose children are dispatched. `None` is the top level.
    pub scope: Option<String>,
    pub pool: VariablePool,
    /// Starts here instead of at the scope's entry nodes.
    pub entry_nodes: Option<Vec<String>>,
    pub entry_params: HashMap<String, Value>,
    pub run: RunContext,
}

impl SubGraphRequest {
    pub fn new(graph: Arc<Graph>, pool: VariablePool, run: RunContext) -> Self {
        Self {
            graph,
            scope: None,
            pool,
            entry_nodes: None,
            entry_params: HashMap::new(),
            run,
        }
    }

    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn starting_at(mut self, node_ids: Vec<String>) -> Self {
        self.entry_nodes = Some(node_ids);
        self
    }

    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.entry_params = params;
        self
    }
}

pub struct SubGraphOutcome {
    pub outcome: RunOutcome,
    /// Pool as the nested dispatch left it.
    pub pool: VariablePool,
}

/// Runs a nested dispatch to its end.
///
/// Boxed because the nested dispatcher runs executors that may nest again.
pub fn run_sub_graph(
    env: DispatchEnv,
    emitter: EventEmitter,
    request: SubGraphRequest,
) -> BoxFuture<'static, WorkflowResult<SubGraphOutcome>> {
    async move {
        let SubGraphRequest {
            graph,
            scope,
            pool,
            entry_nodes,
            entry_params,
            run,
        } = request;

        let mut dispatcher = WorkflowDispatcher::new(graph, env, run, pool, emitter)
            .with_scope(scope)
            .with_entry_params(entry_params);
        if let Some(nodes) = entry_nodes {
            dispatcher = dispatcher.with_entry_nodes(nodes);
        }
        let outcome = dispatcher.run().await?;
        Ok(SubGraphOutcome {
            outcome,
            pool: dispatcher.into_pool(),
        })
    }
    .boxed()
}

/// Interactive nodes can only pause the top-level dispatch.
pub fn reject_pause(outcome: &RunOutcome) -> Result<(), NodeError> {
    match outcome {
        RunOutcome::Paused { interactive, .. } => Err(NodeError::ConfigError(format!(
            "interactive node '{}' cannot run inside a nested dispatch",
            interactive.node_id()
        ))),
        _ => Ok(()),
    }
}
