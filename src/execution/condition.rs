//! Condition Evaluator
//!
//! Pure evaluation of `field operator value` tests against context data.
//! Field values are found by dotted-path lookup; a path that resolves to
//! nothing is "undefined" and only `is_null`/`is_not_null` match it.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::config::ConditionSemantics;
use crate::workflow::model::{ConditionOperator, ExecutionCondition, LogicalOperator};

/// A condition that cannot be evaluated at all.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("condition field path is empty")]
    EmptyField,

    #[error("invalid regex pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("regex_match expects a string pattern, got {0}")]
    PatternNotString(Value),
}

/// Resolves a dotted path. Numeric segments index into arrays.
///
/// ```
/// use flowrunner::execution::condition::lookup;
/// use serde_json::json;
///
/// let data = json!({ "order": { "lines": [{ "sku": "A-1" }] } });
/// assert_eq!(lookup(&data, "order.lines.0.sku"), Some(&json!("A-1")));
/// assert_eq!(lookup(&data, "order.total"), None);
/// ```
pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Evaluates a single condition against `data`.
pub fn evaluate(
    field: &str,
    operator: ConditionOperator,
    expected: &Value,
    data: &Value,
) -> Result<bool, ConditionError> {
    if field.trim().is_empty() {
        return Err(ConditionError::EmptyField);
    }

    let actual = lookup(data, field.trim());

    let absent = matches!(actual, None | Some(Value::Null));

    use ConditionOperator::*;
    let outcome = match (operator, actual) {
        (IsNull, _) => absent,
        (IsNotNull, _) => !absent,
        (_, None) => false,
        (Equals, Some(actual)) => loosely_equal(actual, expected),
        (NotEquals, Some(actual)) => !loosely_equal(actual, expected),
        (GreaterThan, Some(actual)) => compare(actual, expected) == Some(Ordering::Greater),
        (LessThan, Some(actual)) => compare(actual, expected) == Some(Ordering::Less),
        (GreaterEqual, Some(actual)) => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        (LessEqual, Some(actual)) => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        (Contains, Some(actual)) => contains(actual, expected),
        (NotContains, Some(actual)) => !contains(actual, expected),
        (In, Some(actual)) => contains(expected, actual),
        (NotIn, Some(actual)) => !contains(expected, actual),
        (RegexMatch, Some(actual)) => regex_match(actual, expected)?,
    };

    Ok(outcome)
}

/// Evaluates a condition list under the given combination semantics.
/// An empty list is `true`.
pub fn evaluate_all(
    conditions: &[ExecutionCondition],
    data: &Value,
    semantics: ConditionSemantics,
) -> Result<bool, ConditionError> {
    match semantics {
        ConditionSemantics::LeftFold => left_fold(conditions, data),
        ConditionSemantics::Precedence => with_precedence(conditions, data),
    }
}

fn test(condition: &ExecutionCondition, data: &Value) -> Result<bool, ConditionError> {
    evaluate(&condition.field, condition.operator, &condition.value, data)
}

// Each outcome is joined to the running result by the previous condition's
// operator; the last condition's operator is never read.
fn left_fold(conditions: &[ExecutionCondition], data: &Value) -> Result<bool, ConditionError> {
    let mut result = true;
    let mut joiner = LogicalOperator::And;

    for condition in conditions {
        let outcome = test(condition, data)?;
        result = match joiner {
            LogicalOperator::And => result && outcome,
            LogicalOperator::Or => result || outcome,
        };
        joiner = condition.logical_operator.unwrap_or_default();
    }

    Ok(result)
}

// Disjunction of AND-groups. A group stops evaluating at its first false
// member; the list stops at the first true group.
fn with_precedence(conditions: &[ExecutionCondition], data: &Value) -> Result<bool, ConditionError> {
    if conditions.is_empty() {
        return Ok(true);
    }

    let mut group_holds = true;
    for (i, condition) in conditions.iter().enumerate() {
        if group_holds {
            group_holds = test(condition, data)?;
        }

        let closes_group = i + 1 == conditions.len()
            || condition.logical_operator == Some(LogicalOperator::Or);
        if closes_group {
            if group_holds {
                return Ok(true);
            }
            group_holds = true;
        }
    }

    Ok(false)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// `haystack` contains `needle`: substring for strings, membership for
/// arrays, key presence for objects.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(text) => match needle {
            Value::String(part) => text.contains(part.as_str()),
            Value::Number(n) => text.contains(&n.to_string()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn regex_match(actual: &Value, pattern: &Value) -> Result<bool, ConditionError> {
    let pattern = match pattern {
        Value::String(p) => p,
        other => return Err(ConditionError::PatternNotString(other.clone())),
    };
    let regex = Regex::new(pattern).map_err(|e| ConditionError::InvalidPattern {
        pattern: pattern.clone(),
        message: e.to_string(),
    })?;

    Ok(match actual {
        Value::String(s) => regex.is_match(s),
        Value::Number(n) => regex.is_match(&n.to_string()),
        Value::Bool(b) => regex.is_match(&b.to_string()),
        _ => false,
    })
}
