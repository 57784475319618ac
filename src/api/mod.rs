//! Public API layer: stable entry points for external consumers.

mod handle;
mod runner;

pub use handle::RunHandle;
pub use runner::{system_vars, RunRequest, WorkflowRunner, WorkflowRunnerBuilder};
