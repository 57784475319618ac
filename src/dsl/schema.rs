use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::{Edge, Graph, GraphArena, Node, ValueType};
use crate::nodes::NodeExecutorRegistry;

/// Current supported document version
pub const CURRENT_DSL_VERSION: &str = "1";

/// All supported document versions
pub const SUPPORTED_DSL_VERSIONS: &[&str] = &["1"];

/// A workflow document: nodes, edges, app variables and the plugin
/// workflows it may call.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSchema {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// App config variables, seeded into the global scope at run start.
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    /// Workflows callable through plugin nodes, keyed by plugin id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, WorkflowSchema>,
}

fn default_version() -> String {
    CURRENT_DSL_VERSION.to_string()
}

/// An app variable declaration.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VariableDecl {
    pub key: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl WorkflowSchema {
    /// Default values of the declared app variables, coerced to their types.
    /// Variables without a default are left out.
    pub fn default_variables(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .filter_map(|decl| {
                decl.default_value
                    .clone()
                    .map(|v| (decl.key.clone(), decl.value_type.coerce(v)))
            })
            .collect()
    }

    /// Required variables absent from `provided` and without a default.
    pub fn missing_variables(&self, provided: &HashMap<String, Value>) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|d| d.required && d.default_value.is_none() && !provided.contains_key(&d.key))
            .map(|d| d.key.as_str())
            .collect()
    }

    /// Builds every plugin workflow, nested plugins included, into one arena.
    /// A plugin id declared twice with different bodies is rejected.
    pub fn plugin_arena(&self, registry: &NodeExecutorRegistry) -> WorkflowResult<GraphArena> {
        let mut arena = GraphArena::new();
        let mut seen: HashMap<&str, &WorkflowSchema> = HashMap::new();
        let mut stack: Vec<(&str, &WorkflowSchema)> =
            self.plugins.iter().map(|(k, v)| (k.as_str(), v)).collect();
        while let Some((id, plugin)) = stack.pop() {
            if let Some(previous) = seen.get(id) {
                if previous.nodes.len() != plugin.nodes.len()
                    || previous.edges.len() != plugin.edges.len()
                {
                    return Err(WorkflowError::DslParseError(format!(
                        "plugin '{}' is declared twice",
                        id
                    )));
                }
                continue;
            }
            seen.insert(id, plugin);
            stack.extend(plugin.plugins.iter().map(|(k, v)| (k.as_str(), v)));
            let graph = Graph::build(plugin.nodes.clone(), plugin.edges.clone(), registry)?;
            arena.insert(id, Arc::new(graph));
        }
        Ok(arena)
    }

    /// Validates and builds the main workflow graph.
    pub fn into_graph(self, registry: &NodeExecutorRegistry) -> WorkflowResult<Graph> {
        Graph::build(self.nodes, self.edges, registry)
    }
}
