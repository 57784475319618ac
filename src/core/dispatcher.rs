//! Workflow dispatcher, the main execution driver.
//!
//! The [`WorkflowDispatcher`] walks one scope of a [`Graph`]: it keeps a FIFO
//! queue of ready nodes, resolves each node's inputs from the variable pool,
//! runs its [`NodeExecutor`](crate::nodes::NodeExecutor), records usage and
//! then re-evaluates the targets of the node's outgoing edges to decide which
//! of them run, get skipped or keep waiting.
//!
//! Loop bodies, tool calls and sub-workflows reuse the same dispatcher through
//! [`run_sub_graph`](crate::core::sub_graph_runner::run_sub_graph).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::Capabilities;
use crate::core::event_bus::{EventEmitter, RunEvent};
use crate::core::outcome::{RunFailure, RunOutcome, RunResponse};
use crate::core::runtime_context::{RunBudget, RunContext};
use crate::core::snapshot::{GraphRunCursor, RunSnapshot, SNAPSHOT_VERSION};
use crate::core::usage::{summarize, NodeExecutionRecord, UsageAggregator, UsageDelta};
use crate::core::variable_pool::{NodeOutputs, VariablePool};
use crate::error::{NodeError, WorkflowError, WorkflowResult};
use crate::graph::{
    dynamic_selectors, EdgeStatus, Graph, InputPort, Node, NodeRunStatus, PortSource, Selector,
};
use crate::nodes::node_type::{handles, keys};
use crate::nodes::{EdgeRouting, InteractiveRequest, NodeContext, NodeExecutorRegistry};
use crate::nodes::{NodeInputs, NodeRunResult};
use crate::template::{render_text, WithLocalInputs};

/// Engine limits and defaults. Every field has a default, so a partial JSON
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Node executions allowed per run, nested dispatches included.
    pub max_run_times: u32,
    /// Loop iterations allowed per run, across all loop nodes.
    pub max_loop_times: u32,
    pub max_execution_time_secs: u64,
    /// Deepest allowed chain of plugin-module calls.
    pub max_workflow_depth: u32,
    /// Capacity of the event channel handed out by the runner.
    pub event_buffer: usize,
    /// Model round trips a tool-call node may make.
    pub max_tool_rounds: u32,
    /// History rounds passed to chat nodes that don't set their own.
    pub history_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_run_times: 500,
            max_loop_times: 100,
            max_execution_time_secs: 600,
            max_workflow_depth: 20,
            event_buffer: 256,
            max_tool_rounds: 10,
            history_limit: 6,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> WorkflowResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| WorkflowError::DslParseError(format!("engine config: {}", e)))
    }

    pub fn from_toml(text: &str) -> WorkflowResult<Self> {
        toml::from_str(text)
            .map_err(|e| WorkflowError::DslParseError(format!("engine config: {}", e)))
    }

    /// Fresh budget for a run starting at `now_millis`.
    pub fn budget(&self, now_millis: i64) -> RunBudget {
        let timeout_millis = self.max_execution_time_secs.saturating_mul(1000) as i64;
        RunBudget::new(self.max_run_times, self.max_loop_times)
            .with_deadline(now_millis.saturating_add(timeout_millis))
    }
}

/// Everything a dispatch needs besides its graph and state. Cheap to clone;
/// nested dispatches share it with their owner.
#[derive(Clone)]
pub struct DispatchEnv {
    pub registry: Arc<NodeExecutorRegistry>,
    pub capabilities: Capabilities,
    pub config: Arc<EngineConfig>,
}

impl DispatchEnv {
    pub fn new(
        registry: Arc<NodeExecutorRegistry>,
        capabilities: Capabilities,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            capabilities,
            config: Arc::new(config),
        }
    }
}

impl Default for DispatchEnv {
    fn default() -> Self {
        Self::new(
            Arc::new(NodeExecutorRegistry::with_builtins()),
            Capabilities::default(),
            EngineConfig::default(),
        )
    }
}

impl std::fmt::Debug for DispatchEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEnv")
            .field("config", &self.config)
            .finish()
    }
}

/// A failure that ends the dispatch.
struct Abort {
    error: NodeError,
    node_id: Option<String>,
}

impl Abort {
    fn at(node: &Node, error: NodeError) -> Self {
        Self {
            error,
            node_id: Some(node.id.clone()),
        }
    }
}

enum Step {
    Continue,
    Paused(usize, InteractiveRequest),
}

/// Usage a node incurred before it failed. Billed like a success would be.
#[derive(Default)]
struct Incurred {
    usage: Vec<UsageDelta>,
    children: Vec<NodeExecutionRecord>,
}

/// Why a required reference could not be resolved.
enum Unresolved {
    /// The source was skipped, so the consumer is skipped too.
    SourceSkipped,
    Missing(String),
}

/// Runs one scope of a graph to completion, pause or failure.
pub struct WorkflowDispatcher {
    graph: Arc<Graph>,
    env: DispatchEnv,
    context: RunContext,
    pool: VariablePool,
    emitter: EventEmitter,
    scope: Option<String>,
    edge_status: Vec<EdgeStatus>,
    queue: VecDeque<usize>,
    skipped: HashSet<String>,
    completed: Vec<String>,
    entry_override: Option<Vec<String>>,
    entry_nodes: HashSet<usize>,
    entry_params: HashMap<String, Value>,
    replies: HashMap<String, Value>,
    usage: UsageAggregator,
    answers: Vec<String>,
    tool_response: Option<Value>,
    stopped: bool,
    /// Queue already seeded, either by a previous `run` or by `resume`.
    seeded: bool,
}

impl WorkflowDispatcher {
    pub fn new(
        graph: Arc<Graph>,
        env: DispatchEnv,
        context: RunContext,
        pool: VariablePool,
        emitter: EventEmitter,
    ) -> Self {
        let edge_status = graph.initial_edge_status();
        Self {
            graph,
            env,
            context,
            pool,
            emitter,
            scope: None,
            edge_status,
            queue: VecDeque::new(),
            skipped: HashSet::new(),
            completed: Vec::new(),
            entry_override: None,
            entry_nodes: HashSet::new(),
            entry_params: HashMap::new(),
            replies: HashMap::new(),
            usage: UsageAggregator::new(),
            answers: Vec::new(),
            tool_response: None,
            stopped: false,
            seeded: false,
        }
    }

    /// Restricts the dispatch to the children of a container node.
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    /// Starts from these nodes instead of the scope's entry nodes.
    pub fn with_entry_nodes(mut self, node_ids: Vec<String>) -> Self {
        self.entry_override = Some(node_ids);
        self
    }

    /// Values injected as inputs of the entry nodes, overriding their ports.
    pub fn with_entry_params(mut self, params: HashMap<String, Value>) -> Self {
        self.entry_params = params;
        self
    }

    /// Answers an interactive node ahead of time, so the run does not pause there.
    pub fn with_interactive_reply(mut self, node_id: impl Into<String>, reply: Value) -> Self {
        self.replies.insert(node_id.into(), reply);
        self
    }

    /// Restores a paused run. The pending interactive node runs first and
    /// receives `reply`.
    pub fn resume(mut self, snapshot: RunSnapshot, reply: Value) -> WorkflowResult<Self> {
        snapshot.validate_against(&self.graph)?;
        let RunSnapshot {
            cursor,
            variables,
            completed_node_ids,
            run_times,
            loop_times,
            ..
        } = snapshot;

        let mut queue = VecDeque::with_capacity(cursor.ready_queue.len() + 1);
        for id in std::iter::once(&cursor.pending_node_id).chain(cursor.ready_queue.iter()) {
            let index = self
                .graph
                .index_of(id)
                .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))?;
            queue.push_back(index);
        }

        tracing::info!(
            run_id = %self.context.run_id,
            node_id = %cursor.pending_node_id,
            "resuming paused run"
        );
        self.context.budget.restore(run_times, loop_times);
        self.replies.insert(cursor.pending_node_id, reply);
        self.queue = queue;
        self.edge_status = cursor.edge_status;
        self.skipped = cursor.skipped_node_ids.into_iter().collect();
        self.pool = VariablePool::restore(variables);
        self.completed = completed_node_ids;
        self.seeded = true;
        Ok(self)
    }

    pub fn pool(&self) -> &VariablePool {
        &self.pool
    }

    pub fn into_pool(self) -> VariablePool {
        self.pool
    }

    /// Drives the dispatch. `Err` is returned only for problems found before
    /// any node ran; everything else is reported through [`RunOutcome`].
    pub async fn run(&mut self) -> WorkflowResult<RunOutcome> {
        if !self.seeded {
            self.seed_queue()?;
        }
        tracing::debug!(
            run_id = %self.context.run_id,
            depth = self.context.depth,
            scope = ?self.scope,
            queued = self.queue.len(),
            "dispatch started"
        );

        let outcome = loop {
            if self.stopped {
                break RunOutcome::Completed(self.build_response());
            }
            let Some(index) = self.queue.pop_front() else {
                break RunOutcome::Completed(self.build_response());
            };
            if let Err(error) = self.check_run_state() {
                break self.failed(Abort {
                    error,
                    node_id: None,
                });
            }
            match self.dispatch_node(index).await {
                Ok(Step::Continue) => {}
                Ok(Step::Paused(index, request)) => break self.paused(index, request),
                Err(abort) => break self.failed(abort),
            }
        };

        self.emit_terminal(&outcome).await;
        Ok(outcome)
    }

    fn seed_queue(&mut self) -> WorkflowResult<()> {
        let entries = match &self.entry_override {
            Some(ids) => ids
                .iter()
                .map(|id| {
                    self.graph
                        .index_of(id)
                        .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))
                })
                .collect::<WorkflowResult<Vec<usize>>>()?,
            None => self.graph.entry_nodes(self.scope.as_deref()),
        };
        if entries.is_empty() {
            return Err(WorkflowError::NoEntryNode);
        }
        self.entry_nodes = entries.iter().copied().collect();
        self.queue.extend(entries);
        self.seeded = true;
        Ok(())
    }

    fn check_run_state(&self) -> Result<(), NodeError> {
        if self.emitter.is_closed() {
            return Err(NodeError::Cancelled);
        }
        self.context.budget.check_deadline(self.context.now_millis())
    }

    // ================================
    // Node execution
    // ================================

    async fn dispatch_node(&mut self, index: usize) -> Result<Step, Abort> {
        let graph = Arc::clone(&self.graph);
        let node = graph.node_at(index);

        let resolved = match self.resolve_inputs(index, node) {
            Ok(None) => {
                tracing::debug!(node_id = %node.id, "required source was skipped, skipping node");
                if self.skip_node(index) {
                    self.advance(index);
                }
                return Ok(Step::Continue);
            }
            Ok(Some(inputs)) => Ok(inputs),
            Err(error) => Err(error),
        };

        self.context
            .budget
            .consume_run()
            .map_err(|error| Abort::at(node, error))?;
        for edge in graph.incoming(index) {
            self.edge_status[edge] = EdgeStatus::Waiting;
        }
        self.skipped.remove(&node.id);

        tracing::debug!(node_id = %node.id, node_type = %node.node_type, "dispatching node");
        self.emitter
            .emit(RunEvent::NodeStart {
                node_id: node.id.clone(),
                node_type: node.node_type,
                name: node.display_name().to_string(),
            })
            .await;
        let started = self.context.now_millis();

        let inputs = match resolved {
            Ok(inputs) => inputs,
            Err(error) => {
                return self
                    .handle_failure(
                        index,
                        node,
                        NodeInputs::default(),
                        error,
                        started,
                        Incurred::default(),
                    )
                    .await
            }
        };

        let reply = self.replies.remove(&node.id);
        let registry = Arc::clone(&self.env.registry);
        let Some(executor) = registry.get(node.node_type) else {
            let error = NodeError::ConfigError(format!("no executor for {}", node.node_type));
            return self
                .handle_failure(index, node, inputs, error, started, Incurred::default())
                .await;
        };
        let result = {
            let ctx = NodeContext {
                run: &self.context,
                pool: &self.pool,
                graph: &graph,
                env: &self.env,
                emitter: &self.emitter,
                interactive_reply: reply.as_ref(),
            };
            executor.execute(node, &inputs, &ctx).await
        };

        match result {
            Ok(mut result) => match result.interactive.take() {
                Some(request) => {
                    // The node runs again on resume and is charged then.
                    self.context.budget.refund_run();
                    Ok(Step::Paused(index, request))
                }
                None => self.complete(index, node, inputs, result, started).await,
            },
            Err(error) => {
                self.handle_failure(index, node, inputs, error, started, Incurred::default())
                    .await
            }
        }
    }

    async fn complete(
        &mut self,
        index: usize,
        node: &Node,
        inputs: NodeInputs,
        result: NodeRunResult,
        started: i64,
    ) -> Result<Step, Abort> {
        let contract = node.node_type.contract();
        let NodeRunResult {
            mut outputs,
            routing,
            usage,
            answer_text,
            variable_writes,
            tool_response,
            stop_run,
            children,
            halt,
            ..
        } = result;

        // Only budget, deadline and cancellation keep the partial outputs.
        let halt = match halt {
            Some(error) if !error.is_run_control() => {
                let incurred = Incurred { usage, children };
                return self
                    .handle_failure(index, node, inputs, error, started, incurred)
                    .await;
            }
            other => other,
        };

        for port in node.outputs.iter().filter(|p| p.required) {
            if !outputs.contains_key(&port.key) {
                let value = port
                    .default_value
                    .clone()
                    .unwrap_or_else(|| port.value_type.default_value());
                outputs.insert(port.key.clone(), value);
            }
        }

        if !variable_writes.is_empty() {
            if contract.writes_variables {
                for (selector, value) in variable_writes {
                    self.pool.write(&selector, value);
                }
            } else {
                tracing::warn!(
                    node_id = %node.id,
                    node_type = %node.node_type,
                    "node type may not write variables, writes dropped"
                );
            }
        }

        let mut record = self.record(node, &inputs, started);
        record.outputs = summarize(&outputs);
        record.add_usage(&usage);
        let has_children = !children.is_empty();
        record.add_children(children);
        if let Some(error) = &halt {
            record.error = Some(error.to_string());
        }
        if contract.reports_usage || !usage.is_empty() || has_children || halt.is_some() {
            self.usage.push(record);
        }
        if let Some(text) = answer_text.filter(|t| !t.is_empty()) {
            self.answers.push(text);
        }
        if tool_response.is_some() {
            self.tool_response = tool_response;
        }

        self.finish_node(node, outputs).await;
        if let Some(error) = halt {
            return Err(Abort::at(node, error));
        }
        self.route(index, node, &routing, false);
        if stop_run {
            tracing::debug!(node_id = %node.id, "stop requested");
            self.stopped = true;
        }
        self.advance(index);
        Ok(Step::Continue)
    }

    async fn handle_failure(
        &mut self,
        index: usize,
        node: &Node,
        inputs: NodeInputs,
        error: NodeError,
        started: i64,
        incurred: Incurred,
    ) -> Result<Step, Abort> {
        let mut record = self.record(node, &inputs, started);
        record.add_usage(&incurred.usage);
        record.add_children(incurred.children);
        record.error = Some(error.to_string());

        if error.is_run_control() {
            self.usage.push(record);
            return Err(Abort::at(node, error));
        }

        let contract = node.node_type.contract();
        if node.catch_error {
            tracing::warn!(node_id = %node.id, error = %error, "node failed, taking error branch");
            let outputs = HashMap::from([(keys::ERROR.to_string(), Value::String(error.to_string()))]);
            record.outputs = summarize(&outputs);
            self.usage.push(record);
            self.finish_node(node, outputs).await;
            self.route(index, node, &EdgeRouting::All, true);
            self.advance(index);
            return Ok(Step::Continue);
        }

        if contract.fault_tolerant {
            tracing::warn!(node_id = %node.id, error = %error, "node failed, continuing with defaults");
            let mut outputs: NodeOutputs = contract
                .outputs
                .iter()
                .map(|p| (p.key.to_string(), p.value_type.default_value()))
                .collect();
            for port in &node.outputs {
                let value = port
                    .default_value
                    .clone()
                    .unwrap_or_else(|| port.value_type.default_value());
                outputs.entry(port.key.clone()).or_insert(value);
            }
            if contract.outputs.iter().any(|p| p.key == keys::ERROR) {
                outputs.insert(keys::ERROR.to_string(), Value::String(error.to_string()));
            }
            record.outputs = summarize(&outputs);
            self.usage.push(record);
            self.finish_node(node, outputs).await;
            self.route(index, node, &EdgeRouting::All, false);
            self.advance(index);
            return Ok(Step::Continue);
        }

        tracing::warn!(node_id = %node.id, error = %error, "node failed");
        self.usage.push(record);
        Err(Abort::at(node, error))
    }

    fn record(&self, node: &Node, inputs: &NodeInputs, started: i64) -> NodeExecutionRecord {
        let mut record =
            NodeExecutionRecord::new(&node.id, node.display_name(), node.node_type);
        record.inputs = summarize(inputs.values());
        record.duration_ms = (self.context.now_millis() - started).max(0) as u64;
        record
    }

    async fn finish_node(&mut self, node: &Node, outputs: NodeOutputs) {
        let sorted: BTreeMap<String, Value> = outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.pool.set_node_outputs(&node.id, outputs);
        self.completed.push(node.id.clone());
        self.emitter
            .emit(RunEvent::NodeFinish {
                node_id: node.id.clone(),
                outputs: sorted,
            })
            .await;
    }

    // ================================
    // Input resolution
    // ================================

    /// Inputs of a node, each coerced to its declared type. `Ok(None)` means a
    /// required reference points at a skipped node, so this node is skipped.
    fn resolve_inputs(
        &self,
        index: usize,
        node: &Node,
    ) -> Result<Option<NodeInputs>, NodeError> {
        let mut values: HashMap<String, Value> = HashMap::with_capacity(node.inputs.len());
        let mut templates: Vec<(&InputPort, &str)> = Vec::new();

        for port in &node.inputs {
            let value = match &port.source {
                PortSource::FixedValue {
                    value: Value::String(text),
                } => {
                    templates.push((port, text.as_str()));
                    continue;
                }
                PortSource::FixedValue { value } => Some(value.clone()),
                PortSource::Reference { node_id, output_key } => {
                    let selector = Selector::new(node_id, output_key);
                    match self.pool.resolve(&selector) {
                        Some(value) => Some(value),
                        None if port.required => match self.unresolved(&selector) {
                            Unresolved::SourceSkipped => return Ok(None),
                            Unresolved::Missing(reason) => {
                                return Err(NodeError::InputValidationError(format!(
                                    "required input '{}': {}",
                                    port.key, reason
                                )))
                            }
                        },
                        None => None,
                    }
                }
                PortSource::Dynamic { value } => Some(self.resolve_dynamic(value)),
            };
            values.insert(port.key.clone(), finalize(port, value));
        }

        // Fixed strings may refer to sibling inputs, so they render last.
        for (port, text) in templates {
            let rendered = render_text(
                text,
                &WithLocalInputs {
                    node_id: &node.id,
                    inputs: &values,
                    pool: &self.pool,
                },
            );
            values.insert(port.key.clone(), finalize(port, Some(Value::String(rendered))));
        }

        if self.entry_nodes.contains(&index) {
            for (key, value) in &self.entry_params {
                let value = match node.input(key) {
                    Some(port) => finalize(port, Some(value.clone())),
                    None => value.clone(),
                };
                values.insert(key.clone(), value);
            }
        }

        Ok(Some(NodeInputs::new(values)))
    }

    fn unresolved(&self, selector: &Selector) -> Unresolved {
        if selector.is_global() {
            return Unresolved::Missing(format!("variable '{}' is not set", selector.key));
        }
        if self.skipped.contains(&selector.node_id) {
            return Unresolved::SourceSkipped;
        }
        if self.pool.has_outputs(&selector.node_id) {
            return Unresolved::Missing(format!(
                "node '{}' has no output '{}'",
                selector.node_id, selector.key
            ));
        }
        match self.graph.node(&selector.node_id) {
            Some(source) if source.parent_node_id.as_deref() == self.scope.as_deref() => {
                Unresolved::Missing(format!("node '{}' has not run", selector.node_id))
            }
            // Outside this scope and never produced anything: its branch was not taken.
            _ => Unresolved::SourceSkipped,
        }
    }

    /// A dynamic port holds a literal, one selector, or a list of selectors.
    /// Pairs only count as selectors when they name a known node.
    fn resolve_dynamic(&self, value: &Value) -> Value {
        let selectors: Vec<Selector> = dynamic_selectors(value)
            .into_iter()
            .filter(|s| s.is_global() || self.graph.node(&s.node_id).is_some())
            .collect();
        if selectors.is_empty() {
            return match value {
                Value::String(text) => Value::String(render_text(text, &self.pool)),
                other => other.clone(),
            };
        }
        if Selector::from_value(value).is_some() {
            return self.pool.resolve(&selectors[0]).unwrap_or(Value::Null);
        }
        Value::Array(
            selectors
                .iter()
                .map(|s| self.pool.resolve(s).unwrap_or(Value::Null))
                .collect(),
        )
    }

    // ================================
    // Edge routing and readiness
    // ================================

    fn route(&mut self, index: usize, node: &Node, routing: &EdgeRouting, failed: bool) {
        for &edge in self.graph.outgoing(index) {
            let handle = self.graph.edge(edge).source_handle.as_str();
            let status = if node.catch_error && handle == handles::ERROR {
                if failed {
                    EdgeStatus::Active
                } else {
                    EdgeStatus::Skipped
                }
            } else if failed {
                EdgeStatus::Skipped
            } else {
                routing.status_for(handle)
            };
            self.edge_status[edge] = status;
        }
    }

    /// Marks a node skipped and propagates along its outgoing edges. Returns
    /// false if it was already skipped.
    fn skip_node(&mut self, index: usize) -> bool {
        let node = self.graph.node_at(index);
        if !self.skipped.insert(node.id.clone()) {
            return false;
        }
        tracing::debug!(node_id = %node.id, "node skipped");
        for edge in self.graph.incoming(index) {
            self.edge_status[edge] = EdgeStatus::Waiting;
        }
        for &edge in self.graph.outgoing(index) {
            self.edge_status[edge] = EdgeStatus::Skipped;
        }
        true
    }

    /// Re-checks the targets of `from`'s outgoing edges, following skips
    /// transitively.
    fn advance(&mut self, from: usize) {
        let graph = Arc::clone(&self.graph);
        let mut changed = VecDeque::from([from]);
        while let Some(current) = changed.pop_front() {
            let mut seen = HashSet::new();
            for &edge in graph.outgoing(current) {
                let Some(target) = graph.index_of(&graph.edge(edge).target) else {
                    continue;
                };
                if !seen.insert(target) || self.queue.contains(&target) {
                    continue;
                }
                match graph.incoming_groups(target).status(&self.edge_status) {
                    NodeRunStatus::Run => self.queue.push_back(target),
                    NodeRunStatus::Skip => {
                        if self.skip_node(target) {
                            changed.push_back(target);
                        }
                    }
                    NodeRunStatus::Wait => {}
                }
            }
        }
    }

    // ================================
    // Terminal states
    // ================================

    fn build_response(&self) -> RunResponse {
        let node_outputs = self
            .completed
            .iter()
            .filter_map(|id| {
                self.pool
                    .node_outputs(id)
                    .map(|outputs| (id.clone(), outputs.into_iter().collect()))
            })
            .collect();
        RunResponse {
            final_answer: self.answers.concat(),
            usage: self.usage.records().to_vec(),
            total_points: self.usage.total_points(),
            node_outputs,
            variables: self.pool.globals(),
            completed_node_ids: self.completed.clone(),
            tool_response: self.tool_response.clone(),
            stopped: self.stopped,
        }
    }

    fn paused(&self, index: usize, request: InteractiveRequest) -> RunOutcome {
        let mut skipped: Vec<String> = self.skipped.iter().cloned().collect();
        skipped.sort();
        let snapshot = RunSnapshot {
            version: SNAPSHOT_VERSION,
            cursor: GraphRunCursor {
                pending_node_id: self.graph.node_at(index).id.clone(),
                ready_queue: self
                    .queue
                    .iter()
                    .map(|&i| self.graph.node_at(i).id.clone())
                    .collect(),
                edge_status: self.edge_status.clone(),
                skipped_node_ids: skipped,
            },
            variables: self.pool.snapshot(),
            completed_node_ids: self.completed.clone(),
            run_times: self.context.budget.run_times(),
            loop_times: self.context.budget.loop_times(),
            interactive: request.clone(),
        };
        RunOutcome::Paused {
            response: self.build_response(),
            interactive: request,
            snapshot: Box::new(snapshot),
        }
    }

    fn failed(&self, abort: Abort) -> RunOutcome {
        RunOutcome::Failed {
            response: self.build_response(),
            failure: RunFailure::from_node_error(&abort.error, abort.node_id),
        }
    }

    async fn emit_terminal(&self, outcome: &RunOutcome) {
        let run_id = &self.context.run_id;
        let event = match outcome {
            RunOutcome::Completed(response) => {
                tracing::info!(
                    run_id = %run_id,
                    depth = self.context.depth,
                    nodes = response.completed_node_ids.len(),
                    points = response.total_points,
                    "dispatch completed"
                );
                RunEvent::RunFinish {
                    final_answer: response.final_answer.clone(),
                    usage: response.usage.clone(),
                    total_points: response.total_points,
                }
            }
            RunOutcome::Paused {
                interactive,
                snapshot,
                ..
            } => {
                tracing::info!(
                    run_id = %run_id,
                    node_id = %interactive.node_id(),
                    "dispatch paused for user input"
                );
                RunEvent::RunPause {
                    interactive: interactive.clone(),
                    snapshot: snapshot.clone(),
                }
            }
            RunOutcome::Failed { response, failure } => {
                tracing::warn!(
                    run_id = %run_id,
                    kind = ?failure.kind,
                    node_id = ?failure.node_id,
                    message = %failure.message,
                    "dispatch failed"
                );
                RunEvent::RunError {
                    kind: failure.kind,
                    message: failure.message.clone(),
                    node_id: failure.node_id.clone(),
                    partial_usage: response.usage.clone(),
                }
            }
        };
        self.emitter.emit(event).await;
    }
}

/// Coerces a resolved value to the port's type. Unresolved and null values
/// become the type default.
fn finalize(port: &InputPort, value: Option<Value>) -> Value {
    match value {
        Some(value) if !value.is_null() => port.value_type.coerce(value),
        _ => port.value_type.default_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime_context::FakeTimeProvider;
    use crate::graph::{Edge, OutputPort, ValueType};
    use crate::nodes::NodeType;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn build(nodes: Vec<Node>, edges: Vec<Edge>) -> Arc<Graph> {
        let registry = NodeExecutorRegistry::with_builtins();
        Arc::new(Graph::build(nodes, edges, &registry).unwrap())
    }

    fn dispatcher(graph: Arc<Graph>) -> WorkflowDispatcher {
        let context = RunContext::default()
            .with_time_provider(Arc::new(FakeTimeProvider::new(1_700_000_000)));
        WorkflowDispatcher::new(
            graph,
            DispatchEnv::default(),
            context,
            VariablePool::new(),
            EventEmitter::disabled(),
        )
    }

    fn answer(id: &str, text: Value) -> Node {
        Node::new(id, NodeType::Answer).with_input(InputPort::fixed(keys::TEXT, text))
    }

    fn if_else(id: &str, left: i64) -> Node {
        Node::new(id, NodeType::IfElse).with_input(InputPort::fixed(
            keys::IF_ELSE_LIST,
            json!([{
                "condition": "AND",
                "list": [{
                    "variable": ["VARIABLE_NODE_ID", "n"],
                    "condition": "greaterThan",
                    "value": left.to_string()
                }]
            }]),
        ))
    }

    #[test]
    fn test_engine_config_defaults_and_partial_json() {
        let config = EngineConfig::from_json(r#"{"maxRunTimes": 7}"#).unwrap();
        assert_eq!(config.max_run_times, 7);
        assert_eq!(config.max_loop_times, 100);
        assert_eq!(config.history_limit, 6);
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(WorkflowError::DslParseError(_))
        ));
        let config = EngineConfig::from_toml("maxLoopTimes = 3\nhistoryLimit = 2").unwrap();
        assert_eq!(config.max_loop_times, 3);
        assert_eq!(config.history_limit, 2);
        assert_eq!(config.max_run_times, 500);
    }

    #[tokio::test]
    async fn test_linear_run_concatenates_answers() {
        let graph = build(
            vec![
                Node::new("start", NodeType::WorkflowStart),
                answer("a1", json!("Hello, ")),
                answer("a2", json!("world")),
            ],
            vec![Edge::new("start", "a1"), Edge::new("a1", "a2")],
        );
        let outcome = dispatcher(graph).run().await.unwrap();
        let response = outcome.response();
        assert!(outcome.is_completed());
        assert_eq!(response.final_answer, "Hello, world");
        assert_eq!(response.completed_node_ids, vec!["start", "a1", "a2"]);
    }

    #[tokio::test]
    async fn test_untaken_branch_is_skipped() {
        let graph = build(
            vec![
                Node::new("start", NodeType::WorkflowStart),
                if_else("check", 5),
                answer("yes", json!("big")),
                answer("no", json!("small")),
                answer("after_no", json!("!")),
            ],
            vec![
                Edge::new("start", "check"),
                Edge::new("check", "yes").with_handle(handles::IF),
                Edge::new("check", "no").with_handle(handles::ELSE),
                Edge::new("no", "after_no"),
            ],
        );
        let mut pool = VariablePool::new();
        pool.set_global("n", json!(10));
        let mut dispatcher = dispatcher(graph);
        dispatcher.pool = pool;

        let outcome = dispatcher.run().await.unwrap();
        let response = outcome.response();
        assert_eq!(response.final_answer, "big");
        assert!(response.output("no", keys::ANSWER_TEXT).is_none());
        assert!(response.output("after_no", keys::ANSWER_TEXT).is_none());
        assert!(dispatcher.skipped.contains("after_no"));
    }

    #[tokio::test]
    async fn test_missing_reference_fails_node() {
        let graph = build(
            vec![
                Node::new("start", NodeType::WorkflowStart)
                    .with_output(OutputPort::new("nope", ValueType::String)),
                Node::new("a", NodeType::Answer).with_input(
                    InputPort::reference(keys::TEXT, "start", "nope")
                        .typed(ValueType::String)
                        .required(),
                ),
            ],
            vec![Edge::new("start", "a")],
        );
        let outcome = dispatcher(graph).run().await.unwrap();
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.node_id.as_deref(), Some("a"));
        assert!(failure.message.contains("nope"));
    }

    #[tokio::test]
    async fn test_run_budget_stops_run() {
        let graph = build(
            vec![
                Node::new("start", NodeType::WorkflowStart),
                answer("a1", json!("x")),
                answer("a2", json!("y")),
            ],
            vec![Edge::new("start", "a1"), Edge::new("a1", "a2")],
        );
        let mut dispatcher = dispatcher(graph);
        dispatcher.context = dispatcher.context.clone().with_budget(RunBudget::new(2, 10));
        let outcome = dispatcher.run().await.unwrap();
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, crate::error::ErrorKind::BudgetExceeded);
        assert_eq!(outcome.response().final_answer, "x");
    }

    #[tokio::test]
    async fn test_closed_consumer_cancels_run() {
        let graph = build(
            vec![Node::new("start", NodeType::WorkflowStart), answer("a", json!("x"))],
            vec![Edge::new("start", "a")],
        );
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut dispatcher = dispatcher(graph);
        dispatcher.emitter = EventEmitter::new(tx);
        let outcome = dispatcher.run().await.unwrap();
        assert_eq!(
            outcome.failure().map(|f| f.kind),
            Some(crate::error::ErrorKind::Cancelled)
        );
        assert!(outcome.response().completed_node_ids.is_empty());
    }

    /// Fails after billing some tokens.
    struct LateFailure;

    #[async_trait::async_trait]
    impl crate::nodes::NodeExecutor for LateFailure {
        async fn execute(
            &self,
            _node: &Node,
            _inputs: &NodeInputs,
            _ctx: &crate::nodes::NodeContext<'_>,
        ) -> Result<NodeRunResult, NodeError> {
            let mut result = NodeRunResult::default().output("partial", json!(true));
            result.usage.push(UsageDelta {
                model: Some("m".into()),
                input_tokens: 7,
                output_tokens: 3,
                points: 0.5,
            });
            result.halt = Some(NodeError::ExecutionError("late failure".into()));
            Ok(result)
        }
    }

    #[tokio::test]
    async fn test_halted_node_is_billed_and_takes_error_branch() {
        let graph = build(
            vec![
                Node::new("start", NodeType::WorkflowStart),
                Node::new("risky", NodeType::Code)
                    .with_input(InputPort::fixed(keys::CODE, json!("x")))
                    .with_catch_error(),
                answer("fine", json!("fine")),
                answer("caught", json!("caught")),
            ],
            vec![
                Edge::new("start", "risky"),
                Edge::new("risky", "fine"),
                Edge::new("risky", "caught").with_handle(handles::ERROR),
            ],
        );
        let mut registry = NodeExecutorRegistry::with_builtins();
        registry.register(NodeType::Code, Box::new(LateFailure));
        let mut dispatcher = dispatcher(graph);
        dispatcher.env = DispatchEnv::new(
            Arc::new(registry),
            Capabilities::default(),
            EngineConfig::default(),
        );

        let outcome = dispatcher.run().await.unwrap();
        assert!(outcome.is_completed());
        let response = outcome.response();
        assert_eq!(response.final_answer, "caught");
        assert!(response.output("risky", "partial").is_none());

        let record = &response.usage[0];
        assert_eq!(record.node_id, "risky");
        assert_eq!(record.input_tokens, 7);
        assert_eq!(record.output_tokens, 3);
        assert!((response.total_points - 0.5).abs() < 1e-9);
        assert!(record.error.as_deref().unwrap_or_default().contains("late failure"));
    }

    #[tokio::test]
    async fn test_unknown_entry_node_is_rejected_before_dispatch() {
        let graph = build(vec![Node::new("start", NodeType::WorkflowStart)], vec![]);
        let mut dispatcher = dispatcher(graph).with_entry_nodes(vec!["ghost".into()]);
        assert!(matches!(
            dispatcher.run().await,
            Err(WorkflowError::NodeNotFound(id)) if id == "ghost"
        ));
    }
}
