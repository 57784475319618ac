use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::NodeError;
use crate::evaluator::operators::to_f64;
use crate::graph::{Node, Selector, ValueType};
use crate::nodes::executor::{NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::keys;
use crate::template::render_text;

/// One entry of a variable-update node's `updateList`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItem {
    pub variable: Selector,
    #[serde(default)]
    pub value_type: ValueType,
    /// `reference` reads the operand from another variable; anything else is a literal.
    #[serde(default)]
    pub render_type: String,
    #[serde(default)]
    pub update_type: Option<String>,
    #[serde(default)]
    pub input_value: Option<Value>,
    #[serde(default)]
    pub reference_value: Option<Value>,
    /// Older documents store the operand here: `["", literal]` or a selector.
    #[serde(default)]
    pub value: Option<Value>,
}

impl UpdateItem {
    fn is_reference(&self) -> bool {
        self.render_type == "reference"
    }
}

/// The only executor allowed to write global variables and other nodes' outputs.
pub struct VariableUpdateExecutor;

#[async_trait]
impl NodeExecutor for VariableUpdateExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let items: Vec<UpdateItem> = inputs.parse(keys::UPDATE_LIST)?;
        let mut pending: HashMap<Selector, Value> = HashMap::new();
        let mut writes: Vec<(Selector, Value)> = Vec::new();

        for item in &items {
            let target = &item.variable;
            if !target.is_global() && ctx.graph.node(&target.node_id).is_none() {
                tracing::warn!(
                    node_id = %node.id,
                    target = %target.node_id,
                    "variable update targets an unknown node, ignored"
                );
                continue;
            }

            let lookup = |selector: &Selector| {
                pending
                    .get(selector)
                    .cloned()
                    .or_else(|| ctx.pool.resolve(selector))
            };

            let operand = if item.is_reference() {
                item.reference_value
                    .as_ref()
                    .or(item.value.as_ref())
                    .and_then(Selector::from_value)
                    .and_then(|s| lookup(&s))
            } else {
                let literal = item.input_value.clone().or_else(|| {
                    item.value
                        .as_ref()
                        .and_then(Value::as_array)
                        .and_then(|pair| pair.get(1))
                        .cloned()
                });
                literal.map(|v| match v {
                    Value::String(text) => Value::String(render_text(&text, ctx.pool)),
                    other => other,
                })
            };

            let current = lookup(target);
            let operator = item.update_type.as_deref().unwrap_or("set");
            if let Some(next) = apply_operator(operator, item.value_type, current, operand) {
                pending.insert(target.clone(), next.clone());
                writes.retain(|(s, _)| s != target);
                writes.push((target.clone(), next));
            }
        }

        Ok(NodeRunResult {
            variable_writes: writes,
            ..Default::default()
        })
    }
}

/// Applies one update operator. `None` leaves the variable untouched.
pub fn apply_operator(
    operator: &str,
    value_type: ValueType,
    current: Option<Value>,
    operand: Option<Value>,
) -> Option<Value> {
    match operator {
        "set" => Some(
            operand
                .map(|v| value_type.coerce(v))
                .unwrap_or(Value::Null),
        ),
        "add" | "sub" | "mul" | "div" => {
            let old = current.as_ref().and_then(to_f64).unwrap_or(0.0);
            let rhs = operand.as_ref().and_then(to_f64).filter(|n| n.is_finite())?;
            let result = match operator {
                "add" => old + rhs,
                "sub" => old - rhs,
                "mul" => old * rhs,
                _ if rhs == 0.0 => return None,
                _ => old / rhs,
            };
            Some(number_value(result))
        }
        "negate" => Some(Value::Bool(!truthy(current.as_ref()))),
        "push" => {
            let item = operand?;
            let item = match (value_type, item) {
                (ValueType::ArrayObject, Value::String(text)) => {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                }
                (_, item) => item,
            };
            let mut list = match current {
                Some(Value::Array(list)) => list,
                _ => Vec::new(),
            };
            list.push(item);
            Some(Value::Array(list))
        }
        "clear" => Some(Value::Array(Vec::new())),
        _ => operand,
    }
}

/// Truthiness of a stored variable. The strings "true"/"false" count as booleans.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(_) => true,
    }
}

/// Whole results stay integers so `10 + 5` reads back as `15`.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
