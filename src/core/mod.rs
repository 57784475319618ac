//! Run-time machinery: the dispatcher, variable pool, budgets, events,
//! usage accounting and pause snapshots.

pub mod dispatcher;
pub mod event_bus;
pub mod outcome;
pub mod runtime_context;
pub mod snapshot;
pub mod sub_graph_runner;
pub mod usage;
pub mod variable_pool;

pub use dispatcher::{DispatchEnv, EngineConfig, WorkflowDispatcher};
pub use event_bus::{EventEmitter, RunEvent};
pub use outcome::{RunFailure, RunOutcome, RunResponse};
pub use runtime_context::{
    FakeIdGenerator, FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider, RunBudget,
    RunContext, TimeProvider,
};
pub use snapshot::{GraphRunCursor, RunSnapshot, SNAPSHOT_VERSION};
pub use sub_graph_runner::{run_sub_graph, SubGraphOutcome, SubGraphRequest};
pub use usage::{NodeExecutionRecord, UsageAggregator, UsageDelta};
pub use variable_pool::{FrameSnapshot, NodeOutputs, OverlayKind, PoolSnapshot, VariablePool};
