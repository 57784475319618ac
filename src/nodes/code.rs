use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::capability::{CodeLanguage, SandboxRequest};
use crate::error::NodeError;
use crate::graph::Node;
use crate::nodes::executor::{NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::keys;

/// Runs user code in the sandbox capability. Every input other than the code
/// itself is passed to the script as a named variable; the fields of the
/// returned object become outputs, and the whole object is `rawResponse`.
pub struct CodeNodeExecutor;

fn language(code_type: &str) -> Result<CodeLanguage, NodeError> {
    if code_type.is_empty() {
        return Ok(CodeLanguage::default());
    }
    serde_json::from_value(Value::String(code_type.to_lowercase()))
        .map_err(|_| NodeError::ConfigError(format!("unsupported code type '{}'", code_type)))
}

#[async_trait]
impl NodeExecutor for CodeNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let code = inputs.require_str(keys::CODE)?.to_string();
        let language = language(inputs.str(keys::CODE_TYPE))?;
        let variables: Map<String, Value> = inputs
            .values()
            .iter()
            .filter(|(k, _)| k.as_str() != keys::CODE && k.as_str() != keys::CODE_TYPE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let output = ctx
            .env
            .capabilities
            .sandbox
            .run(SandboxRequest {
                code,
                language,
                variables,
            })
            .await?;
        tracing::debug!(node_id = %node.id, fields = output.len(), "code executed");

        let raw = Value::Object(output.clone());
        let mut result = NodeRunResult::with_outputs(output.into_iter().collect());
        result
            .outputs
            .insert(keys::RAW_RESPONSE.to_string(), raw.clone());
        result.tool_response = Some(raw);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_names() {
        assert_eq!(language("").unwrap(), CodeLanguage::Js);
        assert_eq!(language("python3").unwrap(), CodeLanguage::Py);
        assert_eq!(language("JS").unwrap(), CodeLanguage::Js);
        assert!(matches!(language("cobol"), Err(NodeError::ConfigError(_))));
    }
}
