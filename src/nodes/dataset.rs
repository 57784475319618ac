use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

use crate::capability::{ScoredChunk, SearchRequest};
use crate::core::usage::UsageDelta;
use crate::error::NodeError;
use crate::graph::Node;
use crate::nodes::executor::{NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::keys;

const DEFAULT_SIMILARITY: f64 = 0.4;
const DEFAULT_SEARCH_LIMIT: u32 = 5000;
/// Character budget of a concatenated quote list.
const DEFAULT_CONCAT_LIMIT: usize = 5000;

// ================================
// Dataset Search Node
// ================================

pub struct DatasetSearchExecutor;

#[async_trait]
impl NodeExecutor for DatasetSearchExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let query = inputs.require_str(keys::USER_CHAT_INPUT)?.to_string();
        let dataset_ids = dataset_ids(inputs.array(keys::DATASETS));
        if dataset_ids.is_empty() {
            return Err(NodeError::ConfigError("no dataset selected".to_string()));
        }

        let request = SearchRequest {
            query,
            dataset_ids,
            limit: inputs
                .u64(keys::LIMIT)
                .map(|n| n as u32)
                .unwrap_or(DEFAULT_SEARCH_LIMIT),
            similarity: inputs.f64(keys::SIMILARITY).unwrap_or(DEFAULT_SIMILARITY),
            filters: inputs.get(keys::SEARCH_FILTERS).cloned().unwrap_or(Value::Null),
        };
        let response = ctx.env.capabilities.dataset.search(request).await?;
        tracing::debug!(node_id = %node.id, hits = response.chunks.len(), "dataset searched");

        let mut result = NodeRunResult::default()
            .output(keys::QUOTE_QA, serde_json::to_value(&response.chunks)?);
        if let Some(model) = &response.model {
            result.usage.push(UsageDelta::priced(
                model,
                response.usage,
                &ctx.env.capabilities.pricing,
            ));
        }
        Ok(result)
    }
}

/// Dataset ids from either plain strings or `{ "datasetId": ... }` objects.
fn dataset_ids(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(id.clone()),
            Value::Object(obj) => obj
                .get("datasetId")
                .or_else(|| obj.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .filter(|id| !id.is_empty())
        .collect()
}

// ================================
// Dataset Concat Node
// ================================

/// Merges every quote-list input: de-duplicated by chunk id, best score
/// first, cut to a character budget.
pub struct DatasetConcatExecutor;

#[async_trait]
impl NodeExecutor for DatasetConcatExecutor {
    async fn execute(
        &self,
        _node: &Node,
        inputs: &NodeInputs,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let limit = inputs
            .u64(keys::LIMIT)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_CONCAT_LIMIT);

        let mut keys_sorted: Vec<&String> = inputs
            .values()
            .keys()
            .filter(|k| k.as_str() != keys::LIMIT)
            .collect();
        keys_sorted.sort();

        let mut lists = Vec::with_capacity(keys_sorted.len());
        for key in keys_sorted {
            let list: Vec<ScoredChunk> = match inputs.get(key) {
                Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                    NodeError::InputValidationError(format!("'{}' is not a quote list: {}", key, e))
                })?,
                None => Vec::new(),
            };
            lists.push(list);
        }

        let merged = concat_quotes(lists, limit);
        Ok(NodeRunResult::default().output(keys::QUOTE_QA, serde_json::to_value(merged)?))
    }
}

pub fn concat_quotes(lists: Vec<Vec<ScoredChunk>>, char_limit: usize) -> Vec<ScoredChunk> {
    let mut seen = HashSet::new();
    let mut merged: Vec<ScoredChunk> = lists
        .into_iter()
        .flatten()
        .filter(|chunk| seen.insert(chunk.id.clone()))
        .collect();
    // Stable sort keeps input order among equal scores.
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut used = 0;
    let mut out = Vec::new();
    for chunk in merged {
        let size = chunk.content.chars().count();
        if used + size > char_limit && !out.is_empty() {
            break;
        }
        used += size;
        out.push(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(id: &str, content: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            id: id.into(),
            dataset_id: "d".into(),
            content: content.into(),
            source_name: String::new(),
            score,
        }
    }

    #[test]
    fn test_dataset_ids_accepts_both_shapes() {
        let ids = dataset_ids(&[json!("a"), json!({"datasetId": "b"}), json!(1), json!("")]);
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_concat_dedupes_and_sorts() {
        let merged = concat_quotes(
            vec![
                vec![chunk("1", "aa", 0.5), chunk("2", "bb", 0.9)],
                vec![chunk("1", "aa", 0.5), chunk("3", "cc", 0.7)],
            ],
            100,
        );
        let ids: Vec<&str> = merged.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn test_concat_respects_char_limit_but_keeps_one() {
        let merged = concat_quotes(vec![vec![chunk("1", "abcdef", 0.9), chunk("2", "gh", 0.1)]], 3);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "1");
    }
}
