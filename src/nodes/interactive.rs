use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NodeError;
use crate::graph::Node;
use crate::nodes::executor::{EdgeRouting, NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::keys;

/// Question put to the user when a run pauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InteractiveRequest {
    #[serde(rename_all = "camelCase")]
    UserSelect {
        node_id: String,
        description: String,
        options: Vec<SelectOption>,
    },
    #[serde(rename_all = "camelCase")]
    FormInput {
        node_id: String,
        description: String,
        fields: Vec<FormField>,
    },
}

impl InteractiveRequest {
    pub fn node_id(&self) -> &str {
        match self {
            InteractiveRequest::UserSelect { node_id, .. } => node_id,
            InteractiveRequest::FormInput { node_id, .. } => node_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    /// Source handle taken when this option is chosen.
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

// ================================
// User Select Node
// ================================

pub struct UserSelectExecutor;

#[async_trait]
impl NodeExecutor for UserSelectExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let options: Vec<SelectOption> = inputs.parse(keys::USER_SELECT_OPTIONS)?;

        let Some(reply) = ctx.interactive_reply else {
            return Ok(NodeRunResult::pending(InteractiveRequest::UserSelect {
                node_id: node.id.clone(),
                description: inputs.str(keys::DESCRIPTION).to_string(),
                options,
            }));
        };

        // A reply names the option by value or by key.
        let answer = reply.as_str().unwrap_or_default();
        let chosen = options
            .iter()
            .find(|o| o.value == answer)
            .or_else(|| options.iter().find(|o| o.key == answer))
            .ok_or_else(|| {
                NodeError::InputValidationError(format!("'{}' is not one of the options", answer))
            })?;

        Ok(NodeRunResult::default()
            .output(keys::SELECT_RESULT, Value::String(chosen.value.clone()))
            .routed(EdgeRouting::Only(chosen.key.clone())))
    }
}

// ================================
// Form Input Node
// ================================

pub struct FormInputExecutor;

#[async_trait]
impl NodeExecutor for FormInputExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let fields: Vec<FormField> = inputs.parse(keys::USER_INPUT_FORMS)?;

        let Some(reply) = ctx.interactive_reply else {
            return Ok(NodeRunResult::pending(InteractiveRequest::FormInput {
                node_id: node.id.clone(),
                description: inputs.str(keys::DESCRIPTION).to_string(),
                fields,
            }));
        };

        let submitted = match reply {
            Value::Object(map) => map.clone(),
            Value::String(text) => serde_json::from_str::<Map<String, Value>>(text)
                .map_err(|e| NodeError::InputValidationError(format!("form reply: {}", e)))?,
            _ => {
                return Err(NodeError::InputValidationError(
                    "form reply must be an object".to_string(),
                ))
            }
        };

        let mut result = NodeRunResult::default();
        let mut form = Map::new();
        for field in &fields {
            let value = submitted
                .get(&field.key)
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| field.default_value.clone());
            match value {
                Some(value) => {
                    form.insert(field.key.clone(), value.clone());
                    result.outputs.insert(field.key.clone(), value);
                }
                None if field.required => {
                    return Err(NodeError::InputValidationError(format!(
                        "form field '{}' is required",
                        field.key
                    )))
                }
                None => {}
            }
        }
        Ok(result.output(keys::FORM_INPUT_RESULT, Value::Object(form)))
    }
}
