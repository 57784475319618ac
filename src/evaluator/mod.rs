//! Condition evaluation for if-else branches and loop break conditions.

pub mod condition;
pub mod operators;

pub use condition::{
    evaluate_condition, evaluate_group, evaluate_if_else, ConditionGroup, ConditionItem,
    ConditionValueType, LogicalOperator,
};
pub use operators::VariableCondition;
