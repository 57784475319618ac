use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::NodeError;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP capability is not configured")]
    Unavailable,
}

impl From<HttpError> for NodeError {
    fn from(e: HttpError) -> Self {
        NodeError::HttpError(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

#[async_trait]
pub trait HttpRequester: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// [`HttpRequester`] backed by a shared reqwest client.
#[cfg(feature = "http-client")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestRequester {
    client: reqwest::Client,
}

#[cfg(feature = "http-client")]
impl ReqwestRequester {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl HttpRequester for ReqwestRequester {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, val) in &request.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(val),
            ) {
                headers.insert(name, value);
            }
        }

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .query(&request.query)
            .timeout(std::time::Duration::from_secs(request.timeout_secs.max(1)));
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else {
                HttpError::RequestFailed(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp
            .text()
            .await
            .map_err(|e| HttpError::RequestFailed(e.to_string()))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
