use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::nodes::node_type::handles;
use crate::nodes::NodeType;

/// Node id reserved for the global variable scope in references.
pub const GLOBAL_SCOPE_ID: &str = "VARIABLE_NODE_ID";

/// Declared value type of a port. Values are coerced to it on resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Object,
    ArrayString,
    ArrayNumber,
    ArrayBoolean,
    ArrayObject,
    ArrayAny,
    ChatHistory,
    DatasetQuote,
    #[default]
    Any,
}

impl ValueType {
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            ValueType::ArrayString
                | ValueType::ArrayNumber
                | ValueType::ArrayBoolean
                | ValueType::ArrayObject
                | ValueType::ArrayAny
        )
    }

    /// Value used when an optional input cannot be resolved.
    pub fn default_value(&self) -> Value {
        match self {
            ValueType::String => Value::String(String::new()),
            ValueType::Object => Value::Object(Map::new()),
            ValueType::ChatHistory | ValueType::DatasetQuote => Value::Array(Vec::new()),
            t if t.is_array() => Value::Array(Vec::new()),
            _ => Value::Null,
        }
    }

    /// JSON-schema type name used when a port is exposed as a tool parameter.
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Any => "string",
            _ => "array",
        }
    }

    /// Coerce a value into this type. Values already of the right shape pass through.
    pub fn coerce(&self, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        match self {
            ValueType::Any => value,
            ValueType::String => match value {
                Value::String(_) => value,
                Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Null => Value::Null,
            },
            ValueType::Number => match value {
                Value::Number(_) => value,
                Value::String(s) if s.trim().is_empty() => Value::Null,
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Value::Bool(b) => Value::from(if b { 1 } else { 0 }),
                _ => Value::Null,
            },
            ValueType::Boolean => match value {
                Value::Bool(_) => value,
                Value::String(s) => Value::Bool(s.eq_ignore_ascii_case("true")),
                Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
                Value::Array(_) | Value::Object(_) => Value::Bool(true),
                Value::Null => Value::Bool(false),
            },
            ValueType::Object => match value {
                Value::Object(_) | Value::Array(_) => value,
                other => parse_object_string(&other)
                    .filter(Value::is_object)
                    .unwrap_or_else(|| Value::Object(Map::new())),
            },
            ValueType::ChatHistory => match value {
                Value::Array(_) | Value::Number(_) => value,
                other => parse_object_string(&other).unwrap_or(Value::Array(Vec::new())),
            },
            ValueType::DatasetQuote => match value {
                Value::Array(_) => value,
                other => parse_object_string(&other).unwrap_or(Value::Array(Vec::new())),
            },
            _ => match value {
                Value::Array(_) => value,
                other => parse_object_string(&other).unwrap_or_else(|| Value::Array(vec![other])),
            },
        }
    }
}

/// Parses strings that look like a JSON object or array.
fn parse_object_string(value: &Value) -> Option<Value> {
    let s = value.as_str()?.trim();
    let looks_structured =
        (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']'));
    if !looks_structured {
        return None;
    }
    serde_json::from_str(s).ok()
}

/// Reference to a node output (or a global variable when `node_id` is [`GLOBAL_SCOPE_ID`]).
/// Serialized as a two-element array `[nodeId, key]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Selector {
    pub node_id: String,
    pub key: String,
}

impl Selector {
    pub fn new(node_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            key: key.into(),
        }
    }

    pub fn global(key: impl Into<String>) -> Self {
        Self::new(GLOBAL_SCOPE_ID, key)
    }

    pub fn is_global(&self) -> bool {
        self.node_id == GLOBAL_SCOPE_ID
    }

    /// Reads a selector from a JSON value shaped like `["node", "key"]`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_array()?.as_slice() {
            [Value::String(node), Value::String(key)] => Some(Self::new(node, key)),
            _ => None,
        }
    }
}

impl From<(String, String)> for Selector {
    fn from((node_id, key): (String, String)) -> Self {
        Self { node_id, key }
    }
}

impl From<Selector> for (String, String) {
    fn from(selector: Selector) -> Self {
        (selector.node_id, selector.key)
    }
}

/// Where an input port takes its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum PortSource {
    /// Literal value. Strings may carry `{{$node.key$}}` and `{{variable}}` placeholders.
    FixedValue {
        #[serde(default)]
        value: Value,
    },
    /// Output of an upstream node, or a global variable.
    Reference {
        #[serde(rename = "referenceNodeId")]
        node_id: String,
        #[serde(rename = "referenceOutputKey")]
        output_key: String,
    },
    /// User-defined extra input. The value is a literal, a selector, or a list of selectors.
    Dynamic {
        #[serde(default)]
        value: Value,
    },
}

impl PortSource {
    pub fn reference_selector(&self) -> Option<Selector> {
        match self {
            PortSource::Reference {
                node_id,
                output_key,
            } => Some(Selector::new(node_id, output_key)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPort {
    pub key: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(flatten)]
    pub source: PortSource,
    #[serde(default)]
    pub required: bool,
    /// Set when the port is exposed as a tool parameter to a tool-call node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_description: Option<String>,
}

impl InputPort {
    pub fn fixed(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value_type: ValueType::Any,
            source: PortSource::FixedValue { value },
            required: false,
            tool_description: None,
        }
    }

    pub fn reference(
        key: impl Into<String>,
        node_id: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value_type: ValueType::Any,
            source: PortSource::Reference {
                node_id: node_id.into(),
                output_key: output_key.into(),
            },
            required: false,
            tool_description: None,
        }
    }

    pub fn dynamic(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value_type: ValueType::Any,
            source: PortSource::Dynamic { value },
            required: false,
            tool_description: None,
        }
    }

    pub fn typed(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn tool_param(mut self, description: impl Into<String>) -> Self {
        self.tool_description = Some(description.into());
        self
    }

    /// Literal value of a fixed port.
    pub fn fixed_value(&self) -> Option<&Value> {
        match &self.source {
            PortSource::FixedValue { value } => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPort {
    pub key: String,
    #[serde(default)]
    pub value_type: ValueType,
    /// Required outputs missing from an executor's result get `default_value`
    /// (or the type default).
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl OutputPort {
    pub fn new(key: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            key: key.into(),
            value_type,
            required: false,
            default_value: None,
        }
    }
}

/// Workflow node as declared in a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(rename = "nodeId", alias = "id")]
    pub id: String,
    #[serde(rename = "flowNodeType", alias = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputPort>,
    #[serde(default)]
    pub outputs: Vec<OutputPort>,
    /// Owning loop node. Children run only inside that loop's nested scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    /// Turns execution failures into an `error` branch instead of aborting the run.
    #[serde(default)]
    pub catch_error: bool,
    /// Forces the node to run at scope start regardless of its type.
    #[serde(default)]
    pub is_entry: bool,
    /// Description shown to the model when the node is exposed as a tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_description: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            parent_node_id: None,
            catch_error: false,
            is_entry: false,
            tool_description: None,
        }
    }

    pub fn with_input(mut self, input: InputPort) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: OutputPort) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_node_id = Some(parent.into());
        self
    }

    pub fn with_catch_error(mut self) -> Self {
        self.catch_error = true;
        self
    }

    pub fn input(&self, key: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|i| i.key == key)
    }

    /// Fixed literal of an input, if the input exists and is fixed.
    pub fn fixed_input(&self, key: &str) -> Option<&Value> {
        self.input(key).and_then(InputPort::fixed_value)
    }

    /// Whether `key` is a declared output of this node.
    pub fn declares_output(&self, key: &str) -> bool {
        self.outputs.iter().any(|o| o.key == key)
            || self.node_type.contract().outputs.iter().any(|o| o.key == key)
            || (self.catch_error && key == crate::nodes::node_type::keys::ERROR)
            // Pass-through nodes mirror their inputs as outputs.
            || (matches!(self.node_type, NodeType::PluginOutput | NodeType::PluginInput)
                && self.input(key).is_some())
    }

    pub fn is_entry(&self) -> bool {
        self.is_entry || self.node_type.contract().entry
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Runtime status of an edge within one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    #[default]
    Waiting,
    Active,
    Skipped,
}

fn default_source_handle() -> String {
    handles::SOURCE.to_string()
}

fn default_target_handle() -> String {
    handles::TARGET.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    #[serde(default = "default_source_handle")]
    pub source_handle: String,
    pub target: String,
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
    /// Initial status. Edges preset to `skipped` never activate their target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EdgeStatus>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_handle: default_source_handle(),
            target: target.into(),
            target_handle: default_target_handle(),
            status: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = handle.into();
        self
    }

    /// Tool edges attach tool nodes to a tool-call node and never drive readiness.
    pub fn is_tool_edge(&self) -> bool {
        self.source_handle == handles::SELECTED_TOOLS
    }
}
