//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use flowdispatch::capability::{
    CodeSandbox, HttpError, HttpRequest, HttpRequester, HttpResponse, SandboxError,
    SandboxRequest, ScoredChunk,
};
use flowdispatch::{
    parse_workflow, DslFormat, FakeIdGenerator, FakeTimeProvider, NodeExecutorRegistry, RunEvent,
    TimeProvider, WorkflowRunner, WorkflowRunnerBuilder, WorkflowSchema,
};

pub const NOW: i64 = 1_700_000_000;

pub fn load(yaml: &str) -> WorkflowSchema {
    parse_workflow(yaml, DslFormat::Yaml).expect("fixture should parse")
}

/// Runner builder over a YAML document with a frozen clock and sequential ids.
pub fn runner(yaml: &str) -> WorkflowRunnerBuilder {
    runner_with_clock(yaml, Arc::new(FakeTimeProvider::new(NOW)))
}

pub fn runner_with_clock(yaml: &str, clock: Arc<dyn TimeProvider>) -> WorkflowRunnerBuilder {
    let registry = Arc::new(NodeExecutorRegistry::with_builtins());
    WorkflowRunner::from_schema(load(yaml), registry)
        .expect("fixture should build")
        .time_provider(clock)
        .id_generator(Arc::new(FakeIdGenerator::new("run".into())))
}

pub fn chunk(id: &str, content: &str, score: f64) -> ScoredChunk {
    ScoredChunk {
        id: id.to_string(),
        dataset_id: "kb".to_string(),
        content: content.to_string(),
        source_name: format!("{}.md", id),
        score,
    }
}

/// Wire name of every event, in order.
pub fn event_names(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| {
            serde_json::to_value(e)
                .ok()
                .and_then(|v| v.get("event").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default()
        })
        .collect()
}

/// Ids of nodes that emitted `node_start`, in order.
pub fn started_nodes(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::NodeStart { node_id, .. } => Some(node_id.clone()),
            _ => None,
        })
        .collect()
}

/// Sandbox answering every script with a closure.
pub struct FnSandbox<F>(F);

pub fn sandbox<F>(f: F) -> Arc<dyn CodeSandbox>
where
    F: Fn(SandboxRequest) -> Result<Map<String, Value>, SandboxError> + Send + Sync + 'static,
{
    Arc::new(FnSandbox(f))
}

#[async_trait]
impl<F> CodeSandbox for FnSandbox<F>
where
    F: Fn(SandboxRequest) -> Result<Map<String, Value>, SandboxError> + Send + Sync,
{
    async fn run(&self, request: SandboxRequest) -> Result<Map<String, Value>, SandboxError> {
        (self.0)(request)
    }
}

/// HTTP requester replaying queued responses. Once the queue is empty every
/// call gets a 200 with an empty JSON object.
#[derive(Default)]
pub struct FakeHttp {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, status: u16, body: &str) -> Self {
        self.responses.lock().push_back(Ok(HttpResponse {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }));
        self
    }

    pub fn with_error(self, error: HttpError) -> Self {
        self.responses.lock().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpRequester for FakeHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(HttpResponse {
                status: 200,
                headers: Vec::new(),
                body: "{}".to_string(),
            })
        })
    }
}
