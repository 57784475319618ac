//! Placeholder expansion for text inputs.

pub mod variable_resolver;

pub use variable_resolver::{render_text, value_to_text, VariableLookup, WithLocalInputs};
