//! Workflow graph model.
//!
//! A [`Graph`] is built once from node and edge declarations and validated
//! against the node contracts. It precomputes, per node, the grouping of its
//! incoming edges used by the dispatcher to decide run / skip / wait.

pub mod arena;
pub mod builder;
pub mod traversal;
pub mod types;
pub mod validator;

pub use arena::GraphArena;
pub use builder::Graph;
pub use traversal::{IncomingGroups, NodeRunStatus};
pub use types::*;
pub use validator::{dynamic_selectors, is_branch_node, source_handles};
