use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operators::{self as ops, VariableCondition};
use crate::core::variable_pool::VariablePool;
use crate::graph::Selector;
use crate::nodes::node_type::handles;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// How a condition item's comparison value is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionValueType {
    #[default]
    Input,
    /// `value` is a `[nodeId, key]` selector.
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionItem {
    pub variable: Selector,
    pub condition: VariableCondition,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub value_type: ConditionValueType,
}

/// Items joined by one logical operator. An if-else node holds a list of these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub condition: LogicalOperator,
    #[serde(default)]
    pub list: Vec<ConditionItem>,
}

/// Returns the handle of the first matching group (`IF`, `ELSE IF n`), or `ELSE`.
pub fn evaluate_if_else(groups: &[ConditionGroup], pool: &VariablePool) -> String {
    groups
        .iter()
        .position(|group| evaluate_group(group, pool))
        .map(handles::if_else_branch)
        .unwrap_or_else(|| handles::ELSE.to_string())
}

pub fn evaluate_group(group: &ConditionGroup, pool: &VariablePool) -> bool {
    match group.condition {
        LogicalOperator::And => group.list.iter().all(|item| evaluate_condition(item, pool)),
        LogicalOperator::Or => group.list.iter().any(|item| evaluate_condition(item, pool)),
    }
}

/// Evaluates one item. Unresolved variables compare as null.
pub fn evaluate_condition(item: &ConditionItem, pool: &VariablePool) -> bool {
    let actual = pool.resolve(&item.variable).unwrap_or(Value::Null);
    let expected = match item.value_type {
        ConditionValueType::Input => item.value.clone(),
        ConditionValueType::Reference => Selector::from_value(&item.value)
            .and_then(|s| pool.resolve(&s))
            .unwrap_or(Value::Null),
    };

    use VariableCondition::*;
    match item.condition {
        IsEmpty => ops::is_empty(Some(&actual)),
        IsNotEmpty => !ops::is_empty(Some(&actual)),
        EqualTo => ops::equal(&actual, &expected),
        NotEqual => !ops::equal(&actual, &expected),
        GreaterThan => ops::compare_numbers(&actual, &expected, |a, b| a > b),
        GreaterThanOrEqualTo => ops::compare_numbers(&actual, &expected, |a, b| a >= b),
        LessThan => ops::compare_numbers(&actual, &expected, |a, b| a < b),
        LessThanOrEqualTo => ops::compare_numbers(&actual, &expected, |a, b| a <= b),
        Include => ops::include(&actual, &expected),
        NotInclude => !ops::include(&actual, &expected),
        StartWith => ops::to_text(&actual).starts_with(&ops::to_text(&expected)),
        EndWith => ops::to_text(&actual).ends_with(&ops::to_text(&expected)),
        Reg => ops::matches_regex(&actual, &expected),
        LengthEqualTo => ops::compare_length(&actual, &expected, |a, b| a == b),
        LengthNotEqualTo => !ops::compare_length(&actual, &expected, |a, b| a == b),
        LengthGreaterThan => ops::compare_length(&actual, &expected, |a, b| a > b),
        LengthGreaterThanOrEqualTo => ops::compare_length(&actual, &expected, |a, b| a >= b),
        LengthLessThan => ops::compare_length(&actual, &expected, |a, b| a < b),
        LengthLessThanOrEqualTo => ops::compare_length(&actual, &expected, |a, b| a <= b),
    }
}
