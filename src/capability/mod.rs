//! External capabilities the engine calls into: chat models, dataset search,
//! code sandbox, HTTP, model pricing and the registry of callable workflows.
//!
//! Capabilities are injected explicitly through [`Capabilities`]; nothing is
//! looked up from global state.

pub mod chat;
pub mod dataset;
pub mod http;
pub mod pricing;
pub mod sandbox;
pub mod scripted;

use std::sync::Arc;

pub use chat::{
    ChatAccumulator, ChatChunk, ChatCompletion, ChatCompletionOutput, ChatMessage, ChatRequest,
    ChatRole, ChatStream, LlmError, TokenUsage, ToolCall, ToolCallDelta, ToolSpec,
};
pub use dataset::{DatasetError, DatasetSearch, ScoredChunk, SearchRequest, SearchResponse};
#[cfg(feature = "http-client")]
pub use http::ReqwestRequester;
pub use http::{HttpError, HttpRequest, HttpRequester, HttpResponse};
pub use pricing::{ModelPrice, ModelPricing};
pub use sandbox::{CodeLanguage, CodeSandbox, SandboxError, SandboxRequest};
pub use scripted::{ScriptedChat, StaticDataset, Unavailable};

use crate::graph::GraphArena;

/// Handles to every external capability a run may use.
#[derive(Clone)]
pub struct Capabilities {
    pub chat: Arc<dyn ChatCompletion>,
    pub dataset: Arc<dyn DatasetSearch>,
    pub sandbox: Arc<dyn CodeSandbox>,
    pub http: Arc<dyn HttpRequester>,
    pub pricing: Arc<ModelPricing>,
    pub workflows: Arc<GraphArena>,
}

impl Default for Capabilities {
    /// Everything unavailable, except HTTP when the `http-client` feature is on.
    fn default() -> Self {
        #[cfg(feature = "http-client")]
        let http: Arc<dyn HttpRequester> = Arc::new(ReqwestRequester::new());
        #[cfg(not(feature = "http-client"))]
        let http: Arc<dyn HttpRequester> = Arc::new(Unavailable);
        Self {
            chat: Arc::new(Unavailable),
            dataset: Arc::new(Unavailable),
            sandbox: Arc::new(Unavailable),
            http,
            pricing: Arc::new(ModelPricing::default()),
            workflows: Arc::new(GraphArena::default()),
        }
    }
}

impl Capabilities {
    pub fn with_chat(mut self, chat: Arc<dyn ChatCompletion>) -> Self {
        self.chat = chat;
        self
    }

    pub fn with_dataset(mut self, dataset: Arc<dyn DatasetSearch>) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpRequester>) -> Self {
        self.http = http;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    pub fn with_workflows(mut self, workflows: GraphArena) -> Self {
        self.workflows = Arc::new(workflows);
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("workflows", &self.workflows.len())
            .finish_non_exhaustive()
    }
}
