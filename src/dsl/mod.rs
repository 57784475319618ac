//! Workflow documents in JSON, YAML or TOML.

pub mod parser;
pub mod schema;

pub use parser::{parse_workflow, DslFormat};
pub use schema::*;
