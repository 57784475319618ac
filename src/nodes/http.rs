//! HTTP request node executor.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::capability::{HttpRequest, HttpResponse};
use crate::error::NodeError;
use crate::graph::Node;
use crate::nodes::executor::{NodeContext, NodeExecutor, NodeInputs, NodeRunResult};
use crate::nodes::node_type::keys;
use crate::template::{render_text, value_to_text, WithLocalInputs};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u64 = 2;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Delay before retry number `attempt` (0-based): doubles from the base, capped.
pub fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .map(|d| d.min(BACKOFF_CAP))
        .unwrap_or(BACKOFF_CAP)
}

/// Key/value pairs from either `[{key, value}]` or a plain object. Values may
/// carry placeholders.
fn pairs(value: Option<&Value>, render: &dyn Fn(&str) -> String) -> Vec<(String, String)> {
    let mut out = Vec::new();
    match value {
        Some(Value::Array(items)) => {
            for item in items {
                let key = item.get("key").and_then(Value::as_str).unwrap_or_default();
                if key.is_empty() {
                    continue;
                }
                let raw = item.get("value").map(value_to_text).unwrap_or_default();
                out.push((key.to_string(), render(&raw)));
            }
        }
        Some(Value::Object(map)) => {
            for (key, raw) in map {
                out.push((key.clone(), render(&value_to_text(raw))));
            }
        }
        _ => {}
    }
    out
}

/// Looks up `a.b.c` in a JSON document.
fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = doc.get(path) {
        return Some(value);
    }
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        other => other.get(segment),
    })
}

pub struct HttpRequestExecutor;

impl HttpRequestExecutor {
    async fn send_with_retry(
        &self,
        node: &Node,
        request: HttpRequest,
        retries: u32,
        ctx: &NodeContext<'_>,
    ) -> Result<HttpResponse, NodeError> {
        let mut attempt = 0;
        loop {
            let error = match ctx.env.capabilities.http.send(request.clone()).await {
                Ok(response) if !response.is_server_error() => return Ok(response),
                Ok(response) => NodeError::HttpError(format!(
                    "server responded with status {}",
                    response.status
                )),
                Err(e) => NodeError::from(e),
            };
            if attempt >= retries {
                return Err(error);
            }
            let delay = backoff(attempt);
            tracing::debug!(
                node_id = %node.id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying http request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl NodeExecutor for HttpRequestExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeRunResult, NodeError> {
        let url = inputs.require_str(keys::HTTP_URL)?.trim().to_string();
        let method = match inputs.str(keys::HTTP_METHOD) {
            "" => "GET".to_string(),
            m => m.to_uppercase(),
        };
        let lookup = WithLocalInputs {
            node_id: &node.id,
            inputs: inputs.values(),
            pool: ctx.pool,
        };
        let render = |text: &str| render_text(text, &lookup);

        let mut headers = pairs(inputs.get(keys::HTTP_HEADER), &render);
        let query = pairs(inputs.get(keys::HTTP_PARAMS), &render);
        let body = match inputs.str(keys::HTTP_JSON_BODY).trim() {
            "" => None,
            _ if method == "GET" => None,
            text => Some(text.to_string()),
        };
        if body.is_some()
            && !headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        let request = HttpRequest {
            method,
            url,
            headers,
            query,
            body,
            timeout_secs: inputs.u64(keys::HTTP_TIMEOUT).unwrap_or(DEFAULT_TIMEOUT_SECS),
        };
        let retries = inputs.u64(keys::HTTP_RETRIES).unwrap_or(DEFAULT_RETRIES) as u32;
        let response = self.send_with_retry(node, request, retries, ctx).await?;
        if response.status >= 400 {
            return Err(NodeError::HttpError(format!(
                "request failed with status {}: {}",
                response.status, response.body
            )));
        }

        let parsed: Value = serde_json::from_str(&response.body)
            .unwrap_or_else(|_| Value::String(response.body.clone()));
        let mut result = NodeRunResult::default();
        for port in &node.outputs {
            if port.key == keys::HTTP_RAW_RESPONSE || port.key == keys::ERROR {
                continue;
            }
            if let Some(value) = lookup_path(&parsed, &port.key) {
                result
                    .outputs
                    .insert(port.key.clone(), port.value_type.coerce(value.clone()));
            }
        }
        result
            .outputs
            .insert(keys::HTTP_RAW_RESPONSE.to_string(), parsed.clone());
        result.tool_response = Some(parsed);
        Ok(result)
    }
}
