//! Node types, their contracts, and the built-in executors.

pub mod code;
pub mod control;
pub mod dataset;
pub mod executor;
pub mod http;
pub mod interactive;
pub mod llm;
pub mod loop_node;
pub mod node_type;
pub mod plugin;
pub mod tool_call;
pub mod variable_update;

pub use executor::{
    EdgeRouting, NodeContext, NodeExecutor, NodeExecutorRegistry, NodeInputs, NodeRunResult,
};
pub use interactive::{FormField, InteractiveRequest, SelectOption};
pub use node_type::{Branching, NodeContract, NodeType, PortSpec};
