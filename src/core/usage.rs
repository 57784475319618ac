use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{ModelPricing, TokenUsage};
use crate::nodes::NodeType;

/// Longest string kept verbatim in record summaries.
const SUMMARY_STRING_LIMIT: usize = 2000;

/// Usage reported by an executor for one model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub points: f64,
}

impl UsageDelta {
    /// Delta for one model call, priced from the run's price table.
    pub fn priced(model: &str, usage: TokenUsage, pricing: &ModelPricing) -> Self {
        Self {
            model: Some(model.to_string()),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            points: pricing.points(model, usage),
        }
    }
}

/// Per-node execution record, returned with the run response for billing and auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub module_name: String,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens: u64,
    /// Points charged for this node, including nested records.
    pub price: f64,
    pub inputs: Value,
    pub outputs: Value,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Records of nodes run by a nested dispatch owned by this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeExecutionRecord>,
}

impl NodeExecutionRecord {
    pub fn new(node_id: &str, module_name: &str, node_type: NodeType) -> Self {
        Self {
            node_id: node_id.to_string(),
            module_name: module_name.to_string(),
            node_type,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            tokens: 0,
            price: 0.0,
            inputs: Value::Object(Map::new()),
            outputs: Value::Object(Map::new()),
            duration_ms: 0,
            error: None,
            children: Vec::new(),
        }
    }

    pub fn add_usage(&mut self, deltas: &[UsageDelta]) {
        for delta in deltas {
            if self.model.is_none() {
                self.model = delta.model.clone();
            }
            self.input_tokens += delta.input_tokens;
            self.output_tokens += delta.output_tokens;
            self.price += delta.points;
        }
        self.tokens = self.input_tokens + self.output_tokens;
    }

    pub fn add_children(&mut self, children: Vec<NodeExecutionRecord>) {
        self.price += children.iter().map(|c| c.price).sum::<f64>();
        self.children.extend(children);
    }
}

/// Ordered collection of execution records for one run.
#[derive(Debug, Clone, Default)]
pub struct UsageAggregator {
    records: Vec<NodeExecutionRecord>,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: NodeExecutionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[NodeExecutionRecord] {
        &self.records
    }

    pub fn total_points(&self) -> f64 {
        self.records.iter().map(|r| r.price).sum()
    }

    pub fn into_records(self) -> Vec<NodeExecutionRecord> {
        self.records
    }
}

/// Key-sorted copy of a value map with long strings truncated.
pub fn summarize(values: &HashMap<String, Value>) -> Value {
    let mut keys: Vec<&String> = values.keys().collect();
    keys.sort();
    let map: Map<String, Value> = keys
        .into_iter()
        .map(|k| (k.clone(), truncate(&values[k])))
        .collect();
    Value::Object(map)
}

fn truncate(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > SUMMARY_STRING_LIMIT => {
            let cut: String = s.chars().take(SUMMARY_STRING_LIMIT).collect();
            Value::String(format!("{cut}..."))
        }
        other => other.clone(),
    }
}
