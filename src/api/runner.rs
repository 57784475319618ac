//! High-level workflow runner and builder.
//!
//! [`WorkflowRunner`] (constructed via [`WorkflowRunnerBuilder`]) wires a
//! validated graph together with the executor registry, capabilities, engine
//! configuration and run identity, then drives a [`WorkflowDispatcher`] on
//! the tokio runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::capability::{Capabilities, ChatMessage};
use crate::core::dispatcher::{DispatchEnv, EngineConfig, WorkflowDispatcher};
use crate::core::event_bus::{EventEmitter, RunEvent};
use crate::core::outcome::RunOutcome;
use crate::core::runtime_context::{
    IdGenerator, RealIdGenerator, RealTimeProvider, RunContext, TimeProvider,
};
use crate::core::snapshot::RunSnapshot;
use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::WorkflowSchema;
use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::{Graph, GraphArena};
use crate::nodes::node_type::keys;
use crate::nodes::NodeExecutorRegistry;

use super::handle::RunHandle;

/// Keys of the system variables seeded into the global scope.
pub mod system_vars {
    pub const APP_ID: &str = "appId";
    pub const CHAT_ID: &str = "chatId";
    pub const USER_ID: &str = "userId";
    pub const CURRENT_TIME: &str = "cTime";
}

/// One incoming run: the user's question, run variables, history and
/// identity, plus optional per-run budget overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub query: String,
    pub variables: HashMap<String, Value>,
    pub history: Vec<ChatMessage>,
    pub team_id: String,
    pub tmb_id: String,
    pub app_id: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_run_times: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_loop_times: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_execution_time_secs: Option<u64>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    fn configure(&self, base: &EngineConfig) -> EngineConfig {
        let mut config = base.clone();
        if let Some(v) = self.max_run_times {
            config.max_run_times = v;
        }
        if let Some(v) = self.max_loop_times {
            config.max_loop_times = v;
        }
        if let Some(v) = self.max_execution_time_secs {
            config.max_execution_time_secs = v;
        }
        config
    }
}

/// Where a run starts: at the entry nodes, or at the interactive node a
/// previous run paused on.
enum Launch {
    Fresh,
    Resume { snapshot: RunSnapshot, reply: Value },
}

/// A graph ready to run, reusable across independent runs.
pub struct WorkflowRunner {
    graph: Arc<Graph>,
    registry: Arc<NodeExecutorRegistry>,
    capabilities: Capabilities,
    config: EngineConfig,
    app_variables: HashMap<String, Value>,
    required_variables: Vec<String>,
    time_provider: Arc<dyn TimeProvider>,
    id_generator: Arc<dyn IdGenerator>,
}

impl WorkflowRunner {
    /// Create a new builder for an already built graph.
    pub fn builder(graph: Arc<Graph>) -> WorkflowRunnerBuilder {
        WorkflowRunnerBuilder {
            graph,
            registry: None,
            capabilities: Capabilities::default(),
            workflows: None,
            config: EngineConfig::default(),
            app_variables: HashMap::new(),
            required_variables: Vec::new(),
            time_provider: Arc::new(RealTimeProvider),
            id_generator: Arc::new(RealIdGenerator),
            request: RunRequest::default(),
            replies: Vec::new(),
            launch: Launch::Fresh,
        }
    }

    /// Builds the document's graph and plugin workflows with `registry`, and
    /// takes its declared variables as app variables.
    pub fn from_schema(
        schema: WorkflowSchema,
        registry: Arc<NodeExecutorRegistry>,
    ) -> WorkflowResult<WorkflowRunnerBuilder> {
        let workflows = schema.plugin_arena(&registry)?;
        let app_variables = schema.default_variables();
        let required: Vec<String> = schema
            .missing_variables(&app_variables)
            .into_iter()
            .map(str::to_string)
            .collect();
        let graph = schema.into_graph(&registry)?;
        let mut builder = Self::builder(Arc::new(graph))
            .registry(registry)
            .workflows(workflows)
            .app_variables(app_variables);
        builder.required_variables = required;
        Ok(builder)
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Starts a run and returns its handle. Events stream into the handle.
    pub fn spawn(&self, request: RunRequest) -> RunHandle {
        self.launch(request, Vec::new(), Launch::Fresh)
    }

    /// Continues a paused run: the interactive node recorded in `snapshot`
    /// runs first with `reply` as the user's answer.
    pub fn resume(&self, request: RunRequest, snapshot: RunSnapshot, reply: Value) -> RunHandle {
        self.launch(request, Vec::new(), Launch::Resume { snapshot, reply })
    }

    /// Runs to completion without streaming events.
    pub async fn run(&self, request: RunRequest) -> WorkflowResult<RunOutcome> {
        let context = self.context(&request);
        let dispatcher = self.dispatcher(
            &request,
            context,
            EventEmitter::disabled(),
            Vec::new(),
            Launch::Fresh,
        )?;
        drive(dispatcher).await
    }

    fn launch(
        &self,
        request: RunRequest,
        replies: Vec<(String, Value)>,
        launch: Launch,
    ) -> RunHandle {
        let context = self.context(&request);
        let run_id = context.run_id.clone();
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let emitter = EventEmitter::new(tx);
        let prepared = self.dispatcher(&request, context, emitter.clone(), replies, launch);

        let task = tokio::spawn(async move {
            let result = match prepared {
                Ok(dispatcher) => drive(dispatcher).await,
                Err(error) => Err(error),
            };
            if let Err(error) = &result {
                tracing::warn!(error = %error, "run rejected before dispatch");
                emitter
                    .emit(RunEvent::RunError {
                        kind: error.kind(),
                        message: error.to_string(),
                        node_id: None,
                        partial_usage: Vec::new(),
                    })
                    .await;
            }
            result
        });
        RunHandle::new(run_id, rx, task)
    }

    fn context(&self, request: &RunRequest) -> RunContext {
        let config = request.configure(&self.config);
        let context = RunContext {
            run_id: self.id_generator.next_id(),
            team_id: request.team_id.clone(),
            tmb_id: request.tmb_id.clone(),
            app_id: request.app_id.clone(),
            chat_id: request.chat_id.clone(),
            history: Arc::new(request.history.clone()),
            ..RunContext::default()
        }
        .with_time_provider(Arc::clone(&self.time_provider))
        .with_id_generator(Arc::clone(&self.id_generator));
        let budget = config.budget(context.now_millis());
        context.with_budget(budget)
    }

    fn dispatcher(
        &self,
        request: &RunRequest,
        context: RunContext,
        emitter: EventEmitter,
        replies: Vec<(String, Value)>,
        launch: Launch,
    ) -> WorkflowResult<WorkflowDispatcher> {
        let env = DispatchEnv::new(
            Arc::clone(&self.registry),
            self.capabilities.clone(),
            request.configure(&self.config),
        );
        tracing::info!(
            run_id = %context.run_id,
            app_id = %context.app_id,
            chat_id = %context.chat_id,
            resume = matches!(launch, Launch::Resume { .. }),
            "run started"
        );

        let mut dispatcher = match launch {
            Launch::Fresh => {
                if let Some(missing) = self
                    .required_variables
                    .iter()
                    .find(|key| !request.variables.contains_key(key.as_str()))
                {
                    return Err(WorkflowError::MissingVariable(missing.clone()));
                }
                let pool = VariablePool::with_globals(self.seed_globals(request, &context));
                let params = HashMap::from([(
                    keys::USER_CHAT_INPUT.to_string(),
                    Value::String(request.query.clone()),
                )]);
                WorkflowDispatcher::new(Arc::clone(&self.graph), env, context, pool, emitter)
                    .with_entry_params(params)
            }
            Launch::Resume { snapshot, reply } => WorkflowDispatcher::new(
                Arc::clone(&self.graph),
                env,
                context,
                VariablePool::new(),
                emitter,
            )
            .resume(snapshot, reply)?,
        };
        for (node_id, reply) in replies {
            dispatcher = dispatcher.with_interactive_reply(node_id, reply);
        }
        Ok(dispatcher)
    }

    /// System variables, then app variables, then the request's variables;
    /// later sources win.
    fn seed_globals(&self, request: &RunRequest, context: &RunContext) -> HashMap<String, Value> {
        let mut globals = HashMap::from([
            (system_vars::APP_ID.to_string(), Value::String(context.app_id.clone())),
            (system_vars::CHAT_ID.to_string(), Value::String(context.chat_id.clone())),
            (system_vars::USER_ID.to_string(), Value::String(context.tmb_id.clone())),
            (
                system_vars::CURRENT_TIME.to_string(),
                Value::String(format_time(context.now_millis())),
            ),
        ]);
        globals.extend(self.app_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        globals.extend(request.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        globals
    }
}

async fn drive(mut dispatcher: WorkflowDispatcher) -> WorkflowResult<RunOutcome> {
    dispatcher.run().await
}

/// `cTime` as seen by prompts, e.g. `2024-05-01 08:30:00 Wednesday` (UTC).
fn format_time(millis: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S %A").to_string())
        .unwrap_or_default()
}

/// Builder for configuring and launching a [`WorkflowRunner`].
pub struct WorkflowRunnerBuilder {
    graph: Arc<Graph>,
    registry: Option<Arc<NodeExecutorRegistry>>,
    capabilities: Capabilities,
    workflows: Option<GraphArena>,
    config: EngineConfig,
    app_variables: HashMap<String, Value>,
    required_variables: Vec<String>,
    time_provider: Arc<dyn TimeProvider>,
    id_generator: Arc<dyn IdGenerator>,
    request: RunRequest,
    replies: Vec<(String, Value)>,
    launch: Launch,
}

impl WorkflowRunnerBuilder {
    /// Executor registry. Defaults to the built-in executors.
    pub fn registry(mut self, registry: Arc<NodeExecutorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Workflows callable by plugin nodes. Takes precedence over the
    /// capabilities' own arena.
    pub fn workflows(mut self, workflows: GraphArena) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// Set the engine configuration (budgets, timeouts, buffer sizes).
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// App config variables, seeded after the system variables.
    pub fn app_variables(mut self, vars: HashMap<String, Value>) -> Self {
        self.app_variables = vars;
        self
    }

    pub fn time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// The run to start when the builder is spawned directly.
    pub fn request(mut self, request: RunRequest) -> Self {
        self.request = request;
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.request.query = query.into();
        self
    }

    pub fn variables(mut self, vars: HashMap<String, Value>) -> Self {
        self.request.variables = vars;
        self
    }

    pub fn history(mut self, history: Vec<ChatMessage>) -> Self {
        self.request.history = history;
        self
    }

    /// Pre-answers an interactive node so the run does not pause on it.
    pub fn interactive_reply(mut self, node_id: impl Into<String>, reply: Value) -> Self {
        self.replies.push((node_id.into(), reply));
        self
    }

    /// Resume from a paused run instead of starting at the entry nodes.
    pub fn resume_from(mut self, snapshot: RunSnapshot, reply: Value) -> Self {
        self.launch = Launch::Resume { snapshot, reply };
        self
    }

    fn into_parts(self) -> (WorkflowRunner, RunRequest, Vec<(String, Value)>, Launch) {
        let mut capabilities = self.capabilities;
        if let Some(workflows) = self.workflows {
            capabilities = capabilities.with_workflows(workflows);
        }
        let runner = WorkflowRunner {
            graph: self.graph,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(NodeExecutorRegistry::with_builtins())),
            capabilities,
            config: self.config,
            app_variables: self.app_variables,
            required_variables: self.required_variables,
            time_provider: self.time_provider,
            id_generator: self.id_generator,
        };
        (runner, self.request, self.replies, self.launch)
    }

    /// Finish configuration; the runner can then start any number of runs.
    pub fn build(self) -> WorkflowRunner {
        self.into_parts().0
    }

    /// Starts the configured run on the tokio runtime.
    pub fn spawn(self) -> RunHandle {
        let (runner, request, replies, launch) = self.into_parts();
        runner.launch(request, replies, launch)
    }

    /// Runs the configured request to completion, discarding events.
    pub async fn run(self) -> WorkflowResult<RunOutcome> {
        self.spawn().outcome().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime_context::{FakeIdGenerator, FakeTimeProvider};
    use crate::graph::{Edge, InputPort, Node};
    use crate::nodes::NodeType;
    use serde_json::json;

    fn echo_graph() -> Arc<Graph> {
        let nodes = vec![
            Node::new("start", NodeType::WorkflowStart),
            Node::new("answer", NodeType::Answer).with_input(InputPort::fixed(
                keys::TEXT,
                json!("{{$start.userChatInput$}} from {{appId}} at {{cTime}}"),
            )),
        ];
        let edges = vec![Edge::new("start", "answer")];
        Arc::new(Graph::build(nodes, edges, &NodeExecutorRegistry::with_builtins()).unwrap())
    }

    #[test]
    fn test_request_overrides_config() {
        let request: RunRequest =
            serde_json::from_value(json!({"query": "q", "maxRunTimes": 3})).unwrap();
        let config = request.configure(&EngineConfig::default());
        assert_eq!(config.max_run_times, 3);
        assert_eq!(config.max_loop_times, 100);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "1970-01-01 00:00:00 Thursday");
    }

    #[tokio::test]
    async fn test_spawn_seeds_system_variables() {
        let request = RunRequest {
            app_id: "app-1".into(),
            ..RunRequest::new("hi")
        };
        let handle = WorkflowRunner::builder(echo_graph())
            .time_provider(Arc::new(FakeTimeProvider::new(0)))
            .id_generator(Arc::new(FakeIdGenerator::new("run".into())))
            .request(request)
            .spawn();
        let (events, outcome) = handle.collect().await;
        let outcome = outcome.unwrap();
        assert_eq!(
            outcome.response().final_answer,
            "hi from app-1 at 1970-01-01 00:00:00 Thursday"
        );
        assert!(matches!(events.last(), Some(RunEvent::RunFinish { .. })));
    }

    #[tokio::test]
    async fn test_missing_required_variable_is_rejected() {
        let schema: WorkflowSchema = serde_json::from_value(json!({
            "nodes": [{"nodeId": "start", "flowNodeType": "workflowStart"}],
            "variables": [{"key": "lang", "required": true}]
        }))
        .unwrap();
        let registry = Arc::new(NodeExecutorRegistry::with_builtins());
        let runner = WorkflowRunner::from_schema(schema, registry).unwrap().build();

        let (events, outcome) = runner.spawn(RunRequest::new("q")).collect().await;
        assert!(matches!(outcome, Err(WorkflowError::MissingVariable(k)) if k == "lang"));
        assert!(matches!(
            events.as_slice(),
            [RunEvent::RunError { kind: crate::error::ErrorKind::Validation, .. }]
        ));

        let ok = runner
            .spawn(RunRequest::new("q").with_variable("lang", json!("en")))
            .outcome()
            .await
            .unwrap();
        assert!(ok.is_completed());
    }
}
