use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::variable_pool::VariablePool;

/// Nested placeholder expansion stops at this depth.
const MAX_REPLACEMENT_DEPTH: usize = 10;

/// Source of values for placeholder expansion.
pub trait VariableLookup {
    fn node_value(&self, node_id: &str, key: &str) -> Option<Value>;
    fn global(&self, key: &str) -> Option<Value>;
}

impl VariableLookup for VariablePool {
    fn node_value(&self, node_id: &str, key: &str) -> Option<Value> {
        self.get(node_id, key)
    }

    fn global(&self, key: &str) -> Option<Value> {
        self.get_global(key)
    }
}

fn node_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\$([^.{}$]+)\.([^${}]+)\$\}\}").expect("valid regex"))
}

fn global_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([A-Za-z0-9_\-]+)\}\}").expect("valid regex"))
}

/// Renders a value as text: strings verbatim, null as empty, everything else as JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Expands `{{variable}}` (global variables) and `{{$nodeId.key$}}` (node
/// outputs, or globals under the reserved scope id) in `text`.
///
/// Unknown `{{variable}}` placeholders are left untouched. Unresolved node
/// placeholders become empty. Values that themselves contain placeholders are
/// expanded again, up to a fixed depth; a value referring to itself is not.
pub fn render_text(text: &str, lookup: &dyn VariableLookup) -> String {
    render_at_depth(text, lookup, 0)
}

fn render_at_depth(text: &str, lookup: &dyn VariableLookup, depth: usize) -> String {
    if text.is_empty() || depth > MAX_REPLACEMENT_DEPTH {
        return text.to_string();
    }

    let text = global_pattern().replace_all(text, |caps: &Captures<'_>| {
        lookup
            .global(&caps[1])
            .map(|v| value_to_text(&v))
            .unwrap_or_else(|| caps[0].to_string())
    });

    node_pattern()
        .replace_all(&text, |caps: &Captures<'_>| {
            let (node_id, key) = (&caps[1], &caps[2]);
            let value = if node_id == crate::graph::GLOBAL_SCOPE_ID {
                lookup.global(key)
            } else {
                lookup.node_value(node_id, key)
            };
            let rendered = value.as_ref().map(value_to_text).unwrap_or_default();
            if rendered.contains(&caps[0]) || !node_pattern().is_match(&rendered) {
                rendered
            } else {
                render_at_depth(&rendered, lookup, depth + 1)
            }
        })
        .into_owned()
}

/// Lookup that lets a node's template refer to its own resolved inputs,
/// falling back to the pool for everything else.
pub struct WithLocalInputs<'a> {
    pub node_id: &'a str,
    pub inputs: &'a std::collections::HashMap<String, Value>,
    pub pool: &'a VariablePool,
}

impl VariableLookup for WithLocalInputs<'_> {
    fn node_value(&self, node_id: &str, key: &str) -> Option<Value> {
        self.pool.get(node_id, key).or_else(|| {
            (node_id == self.node_id)
                .then(|| self.inputs.get(key).cloned())
                .flatten()
        })
    }

    fn global(&self, key: &str) -> Option<Value> {
        self.pool.get_global(key)
    }
}
