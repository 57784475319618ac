use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied by a condition item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableCondition {
    IsEmpty,
    IsNotEmpty,
    EqualTo,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    Include,
    NotInclude,
    StartWith,
    EndWith,
    Reg,
    LengthEqualTo,
    LengthNotEqualTo,
    LengthGreaterThan,
    LengthGreaterThanOrEqualTo,
    LengthLessThan,
    LengthLessThanOrEqualTo,
}

/// Empty: unset, null, "", [] or {}.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(arr)) => arr.is_empty(),
        Some(Value::Object(obj)) => obj.is_empty(),
        Some(_) => false,
    }
}

pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn to_text(value: &Value) -> String {
    crate::template::value_to_text(value)
}

/// Length of a string (in chars) or an array.
pub fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(arr) => Some(arr.len()),
        _ => None,
    }
}

/// Equality that tolerates numeric strings and mixed representations.
pub fn equal(value: &Value, target: &Value) -> bool {
    if value == target {
        return true;
    }
    match (value, target) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (to_f64(value), to_f64(target)) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(&b.to_string())
        }
        _ => to_text(value) == to_text(target),
    }
}

/// Substring for strings, element membership for arrays.
pub fn include(value: &Value, target: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(&to_text(target)),
        Value::Array(arr) => arr.iter().any(|item| equal(item, target)),
        _ => false,
    }
}

pub fn compare_numbers(value: &Value, target: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (to_f64(value), to_f64(target)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

pub fn compare_length(value: &Value, target: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (length(value), to_f64(target)) {
        (Some(len), Some(b)) => cmp(len as f64, b),
        _ => false,
    }
}

/// Regex match. Invalid patterns never match.
pub fn matches_regex(value: &Value, pattern: &Value) -> bool {
    let pattern = to_text(pattern);
    // Accept the `/pattern/flags` form as well as a bare pattern.
    let (body, case_insensitive) = match pattern.strip_prefix('/').and_then(|p| p.rsplit_once('/')) {
        Some((body, flags)) => (body.to_string(), flags.contains('i')),
        None => (pattern.clone(), false),
    };
    regex::RegexBuilder::new(&body)
        .case_insensitive(case_insensitive)
        .build()
        .map(|re| re.is_match(&to_text(value)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_empty() {
        assert!(is_empty(None));
        assert!(is_empty(Some(&json!(""))));
        assert!(is_empty(Some(&json!([]))));
        assert!(!is_empty(Some(&json!(0))));
        assert!(!is_empty(Some(&json!(false))));
    }

    #[test]
    fn test_equal_across_representations() {
        assert!(equal(&json!(3), &json!("3")));
        assert!(equal(&json!(true), &json!("true")));
        assert!(equal(&json!("a"), &json!("a")));
        assert!(!equal(&json!("a"), &json!("b")));
    }

    #[test]
    fn test_include() {
        assert!(include(&json!("hello world"), &json!("world")));
        assert!(include(&json!([1, 2, 3]), &json!("2")));
        assert!(!include(&json!({"a": 1}), &json!("a")));
    }

    #[test]
    fn test_length_comparisons() {
        assert!(compare_length(&json!("abc"), &json!(3), |a, b| a == b));
        assert!(compare_length(&json!([1, 2]), &json!("1"), |a, b| a > b));
        assert!(!compare_length(&json!(5), &json!(1), |a, b| a > b));
    }

    #[test]
    fn test_regex() {
        assert!(!matches_regex(&json!("Hello"), &json!("^h")));
        assert!(matches_regex(&json!("Hello"), &json!("/^h/i")));
        assert!(!matches_regex(&json!("x"), &json!("(")));
    }
}
