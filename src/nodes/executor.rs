use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::dispatcher::DispatchEnv;
use crate::core::event_bus::EventEmitter;
use crate::core::runtime_context::RunContext;
use crate::core::usage::{NodeExecutionRecord, UsageDelta};
use crate::core::variable_pool::VariablePool;
use crate::error::NodeError;
use crate::graph::{EdgeStatus, Graph, Node, Selector};
use crate::nodes::interactive::InteractiveRequest;
use crate::nodes::node_type::NodeType;

/// Trait for node execution. Each node type implements this.
///
/// Executors read the pool but never write it. Everything they want
/// recorded goes back through [`NodeRunResult`].
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError>;
}

/// Everything an executor may look at while it runs.
pub struct NodeContext<'a> {
    pub run: &'a RunContext,
    pub pool: &'a VariablePool,
    pub graph: &'a Arc<Graph>,
    pub env: &'a DispatchEnv,
    pub emitter: &'a EventEmitter,
    /// User reply for an interactive node being resumed.
    pub interactive_reply: Option<&'a Value>,
}

/// Which outgoing edges become active after a node completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EdgeRouting {
    #[default]
    All,
    /// Only edges leaving this handle are active; every other edge is skipped.
    Only(String),
    /// Explicit per-handle statuses. Unlisted handles are active.
    Statuses(HashMap<String, EdgeStatus>),
}

impl EdgeRouting {
    pub fn status_for(&self, handle: &str) -> EdgeStatus {
        match self {
            EdgeRouting::All => EdgeStatus::Active,
            EdgeRouting::Only(selected) if selected == handle => EdgeStatus::Active,
            EdgeRouting::Only(_) => EdgeStatus::Skipped,
            EdgeRouting::Statuses(map) => map.get(handle).copied().unwrap_or(EdgeStatus::Active),
        }
    }
}

/// What an executor hands back to the dispatcher.
#[derive(Debug, Default)]
pub struct NodeRunResult {
    pub outputs: HashMap<String, Value>,
    pub routing: EdgeRouting,
    pub usage: Vec<UsageDelta>,
    /// Text contributed to the run's final answer.
    pub answer_text: Option<String>,
    /// Writes outside the node's own output slot. Applied only for node
    /// types whose contract allows it.
    pub variable_writes: Vec<(Selector, Value)>,
    /// Set when the node needs user input before it can finish.
    pub interactive: Option<InteractiveRequest>,
    pub tool_response: Option<Value>,
    /// Ends the run after this node, as if the queue had drained.
    pub stop_run: bool,
    /// Records of nodes run by a nested dispatch.
    pub children: Vec<NodeExecutionRecord>,
    /// The node failed after incurring `usage` or `children`, which are
    /// still recorded. Budget, deadline and cancellation errors also keep
    /// the outputs and abort the run; any other error is handled like a
    /// returned `Err`.
    pub halt: Option<NodeError>,
}

impl NodeRunResult {
    pub fn with_outputs(outputs: HashMap<String, Value>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    pub fn output(mut self, key: &str, value: Value) -> Self {
        self.outputs.insert(key.to_string(), value);
        self
    }

    pub fn routed(mut self, routing: EdgeRouting) -> Self {
        self.routing = routing;
        self
    }

    pub fn pending(request: InteractiveRequest) -> Self {
        Self {
            interactive: Some(request),
            ..Default::default()
        }
    }
}

/// Resolved input values of one node execution, already coerced to the
/// declared port types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInputs {
    values: HashMap<String, Value>,
}

impl NodeInputs {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    pub fn str(&self, key: &str) -> &str {
        self.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// String input that must be present and non-empty.
    pub fn require_str(&self, key: &str) -> Result<&str, NodeError> {
        match self.str(key) {
            "" => Err(NodeError::InputValidationError(format!(
                "input '{}' is empty",
                key
            ))),
            s => Ok(s),
        }
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.f64(key).filter(|n| *n >= 0.0).map(|n| n as u64)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn array(&self, key: &str) -> &[Value] {
        self.get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Deserializes an input into a typed configuration value.
    pub fn parse<T: DeserializeOwned>(&self, key: &str) -> Result<T, NodeError> {
        let value = self.get(key).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| NodeError::ConfigError(format!("input '{}': {}", key, e)))
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }
}

/// Registry of node executors by node type.
pub struct NodeExecutorRegistry {
    executors: HashMap<NodeType, Box<dyn NodeExecutor>>,
}

impl NodeExecutorRegistry {
    /// Registry without any executor. Mostly useful for tests.
    pub fn empty() -> Self {
        NodeExecutorRegistry {
            executors: HashMap::new(),
        }
    }

    /// Registry with an executor for every built-in node type.
    pub fn with_builtins() -> Self {
        use super::{
            code, control, dataset, http, interactive, llm, loop_node, plugin, tool_call,
            variable_update,
        };

        let mut registry = Self::empty();
        registry.register(NodeType::WorkflowStart, Box::new(control::StartNodeExecutor));
        registry.register(NodeType::Answer, Box::new(control::AnswerNodeExecutor));
        registry.register(NodeType::IfElse, Box::new(control::IfElseNodeExecutor));
        registry.register(NodeType::TextEditor, Box::new(control::TextEditorNodeExecutor));
        registry.register(NodeType::StopTool, Box::new(control::StopToolNodeExecutor));
        registry.register(NodeType::PluginInput, Box::new(control::PassThroughExecutor));
        registry.register(NodeType::PluginOutput, Box::new(control::PassThroughExecutor));
        registry.register(NodeType::LoopStart, Box::new(control::PassThroughExecutor));
        registry.register(NodeType::LoopEnd, Box::new(control::PassThroughExecutor));
        registry.register(NodeType::Loop, Box::new(loop_node::LoopNodeExecutor));
        registry.register(NodeType::DatasetSearch, Box::new(dataset::DatasetSearchExecutor));
        registry.register(NodeType::DatasetConcat, Box::new(dataset::DatasetConcatExecutor));
        registry.register(NodeType::ChatNode, Box::new(llm::ChatNodeExecutor));
        registry.register(NodeType::ClassifyQuestion, Box::new(llm::ClassifyQuestionExecutor));
        registry.register(NodeType::ToolCall, Box::new(tool_call::ToolCallExecutor));
        registry.register(NodeType::VariableUpdate, Box::new(variable_update::VariableUpdateExecutor));
        registry.register(NodeType::Code, Box::new(code::CodeNodeExecutor));
        registry.register(NodeType::HttpRequest, Box::new(http::HttpRequestExecutor));
        registry.register(NodeType::PluginModule, Box::new(plugin::PluginModuleExecutor));
        registry.register(NodeType::UserSelect, Box::new(interactive::UserSelectExecutor));
        registry.register(NodeType::FormInput, Box::new(interactive::FormInputExecutor));
        registry
    }

    /// Registers or replaces the executor for a node type.
    pub fn register(&mut self, node_type: NodeType, executor: Box<dyn NodeExecutor>) {
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: NodeType) -> Option<&dyn NodeExecutor> {
        self.executors.get(&node_type).map(|e| e.as_ref())
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }
}

impl Default for NodeExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_cover_every_node_type() {
        let registry = NodeExecutorRegistry::with_builtins();
        for node_type in NodeType::ALL {
            assert!(registry.contains(node_type), "{} missing", node_type);
        }
        assert!(!NodeExecutorRegistry::empty().contains(NodeType::Answer));
    }

    #[test]
    fn test_routing_status() {
        assert_eq!(EdgeRouting::All.status_for("x"), EdgeStatus::Active);
        let only = EdgeRouting::Only("IF".into());
        assert_eq!(only.status_for("IF"), EdgeStatus::Active);
        assert_eq!(only.status_for("ELSE"), EdgeStatus::Skipped);
        let explicit = EdgeRouting::Statuses(HashMap::from([(
            "a".to_string(),
            EdgeStatus::Skipped,
        )]));
        assert_eq!(explicit.status_for("a"), EdgeStatus::Skipped);
        assert_eq!(explicit.status_for("b"), EdgeStatus::Active);
    }

    #[test]
    fn test_inputs_accessors() {
        let inputs = NodeInputs::new(HashMap::from([
            ("s".to_string(), json!("text")),
            ("n".to_string(), json!(3.0)),
            ("b".to_string(), json!(false)),
            ("null".to_string(), Value::Null),
        ]));
        assert_eq!(inputs.str("s"), "text");
        assert_eq!(inputs.u64("n"), Some(3));
        assert!(!inputs.bool_or("b", true));
        assert!(inputs.bool_or("null", true));
        assert!(inputs.require_str("missing").is_err());
        assert!(inputs.array("s").is_empty());
    }
}
