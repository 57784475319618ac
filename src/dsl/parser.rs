use std::path::Path;

use crate::error::WorkflowError;

use super::schema::{WorkflowSchema, SUPPORTED_DSL_VERSIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DslFormat {
    Yaml,
    Json,
    Toml,
}

impl DslFormat {
    /// Format implied by a file extension. Unknown extensions read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("yaml") | Some("yml") => DslFormat::Yaml,
            Some("toml") => DslFormat::Toml,
            _ => DslFormat::Json,
        }
    }
}

/// Parses a workflow document. Only the shape is checked here; graph rules
/// are enforced when the schema is built into a [`crate::graph::Graph`].
pub fn parse_workflow(content: &str, format: DslFormat) -> Result<WorkflowSchema, WorkflowError> {
    let schema: WorkflowSchema = match format {
        DslFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| WorkflowError::DslParseError(e.to_string()))?,
        DslFormat::Json => serde_json::from_str(content)
            .map_err(|e| WorkflowError::DslParseError(e.to_string()))?,
        DslFormat::Toml => {
            let toml_val: toml::Value = toml::from_str(content)
                .map_err(|e| WorkflowError::DslParseError(e.to_string()))?;
            serde_json::from_value(toml_value_to_json(toml_val))
                .map_err(|e| WorkflowError::DslParseError(e.to_string()))?
        }
    };
    if !SUPPORTED_DSL_VERSIONS.contains(&schema.version.as_str()) {
        return Err(WorkflowError::DslParseError(format!(
            "unsupported document version '{}'",
            schema.version
        )));
    }
    Ok(schema)
}

/// TOML has no null, and datetimes are stringified.
fn toml_value_to_json(val: toml::Value) -> serde_json::Value {
    match val {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_value_to_json).collect())
        }
        toml::Value::Table(tbl) => serde_json::Value::Object(
            tbl.into_iter()
                .map(|(k, v)| (k, toml_value_to_json(v)))
                .collect(),
        ),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PortSource;
    use crate::nodes::NodeType;

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: answer
    flowNodeType: answerNode
    inputs:
      - key: text
        source: reference
        referenceNodeId: start
        referenceOutputKey: userChatInput
edges:
  - source: start
    target: answer
"#;
        let schema = parse_workflow(yaml, DslFormat::Yaml).unwrap();
        assert_eq!(schema.nodes.len(), 2);
        assert_eq!(schema.nodes[0].node_type, NodeType::WorkflowStart);
        assert!(matches!(
            schema.nodes[1].inputs[0].source,
            PortSource::Reference { .. }
        ));
        assert_eq!(schema.edges[0].source_handle, "source");
    }

    #[test]
    fn test_parse_json_with_short_aliases() {
        let json = r#"{"nodes": [{"id": "s", "type": "workflowStart"}], "edges": []}"#;
        let schema = parse_workflow(json, DslFormat::Json).unwrap();
        assert_eq!(schema.nodes[0].id, "s");
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[[nodes]]
nodeId = "start"
flowNodeType = "workflowStart"
"#;
        let schema = parse_workflow(toml, DslFormat::Toml).unwrap();
        assert_eq!(schema.nodes[0].id, "start");
        assert!(schema.edges.is_empty());
    }

    #[test]
    fn test_rejects_bad_documents() {
        assert!(matches!(
            parse_workflow("nodes: [", DslFormat::Yaml),
            Err(WorkflowError::DslParseError(_))
        ));
        assert!(matches!(
            parse_workflow(r#"{"version": "9", "nodes": []}"#, DslFormat::Json),
            Err(WorkflowError::DslParseError(_))
        ));
        assert!(matches!(
            parse_workflow(r#"{"nodes": [{"nodeId": "x", "flowNodeType": "nope"}]}"#, DslFormat::Json),
            Err(WorkflowError::DslParseError(_))
        ));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(DslFormat::from_path(Path::new("a.yml")), DslFormat::Yaml);
        assert_eq!(DslFormat::from_path(Path::new("a.TOML")), DslFormat::Toml);
        assert_eq!(DslFormat::from_path(Path::new("a.json")), DslFormat::Json);
    }
}
