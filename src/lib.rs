//! # flowdispatch: a workflow dispatch engine for LLM applications
//!
//! `flowdispatch` runs typed node graphs (start, answer, if-else, loop, dataset
//! search, chat, tool call, code, HTTP, plugin, interactive nodes and more)
//! with:
//!
//! - **Data-driven scheduling**: a node runs once its incoming edges say so;
//!   untaken branches are skipped transitively.
//! - **Variable propagation**: node outputs and globals live in a
//!   [`VariablePool`]; loop bodies and tool calls get isolated overlays.
//! - **Streaming**: an ordered [`RunEvent`] stream over a bounded channel.
//! - **Usage accounting**: one [`NodeExecutionRecord`] per node, priced in points.
//! - **Interactive pause/resume**: a serializable [`RunSnapshot`].
//! - **Run budgets**: run-times, loop-times, wall-clock deadline and sub-workflow depth.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowdispatch::{parse_workflow, DslFormat, NodeExecutorRegistry, RunRequest, WorkflowRunner};
//!
//! #[tokio::main]
//! async fn main() {
//!     let yaml = std::fs::read_to_string("workflow.yaml").unwrap();
//!     let schema = parse_workflow(&yaml, DslFormat::Yaml).unwrap();
//!     let registry = Arc::new(NodeExecutorRegistry::with_builtins());
//!     let runner = WorkflowRunner::from_schema(schema, registry).unwrap().build();
//!     let (events, outcome) = runner.spawn(RunRequest::new("hello")).collect().await;
//!     println!("{} events, {:?}", events.len(), outcome);
//! }
//! ```
//!
//! # Feature Flags
//!
//! | Flag | Description |
//! |------|-------------|
//! | `http-client` | Bundles a `reqwest`-backed requester for the HTTP request node (default) |

pub mod api;
pub mod capability;
pub mod core;
pub mod dsl;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod nodes;
pub mod template;

pub use crate::api::{RunHandle, RunRequest, WorkflowRunner, WorkflowRunnerBuilder};
pub use crate::capability::Capabilities;
pub use crate::core::{
    DispatchEnv, EngineConfig, EventEmitter, FakeIdGenerator, FakeTimeProvider, IdGenerator,
    NodeExecutionRecord, RealIdGenerator, RealTimeProvider, RunBudget, RunContext, RunEvent,
    RunFailure, RunOutcome, RunResponse, RunSnapshot, TimeProvider, UsageAggregator,
    VariablePool, WorkflowDispatcher,
};
pub use crate::dsl::{parse_workflow, DslFormat, WorkflowSchema};
pub use crate::error::{ErrorKind, NodeError, WorkflowError, WorkflowResult};
pub use crate::graph::{Graph, GraphArena};
pub use crate::nodes::{NodeExecutor, NodeExecutorRegistry, NodeType};
