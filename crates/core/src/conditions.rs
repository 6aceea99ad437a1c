//! Predicates over a request's metadata payload.
//!
//! Workflows use them to gate level activation (`required_conditions`) and to
//! short-circuit approval (`auto_approve_conditions`). The engine only sees
//! the [`ConditionEvaluator`] trait so deployments can plug in their own rules.

use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    Exists { field: String },
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    GreaterThan { field: String, value: Decimal },
    GreaterOrEqual { field: String, value: Decimal },
    LessThan { field: String, value: Decimal },
    LessOrEqual { field: String, value: Decimal },
}

impl Condition {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::All { conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::Any { conditions }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals { field: field.into(), value: value.into() }
    }

    pub fn greater_or_equal(field: impl Into<String>, value: Decimal) -> Self {
        Self::GreaterOrEqual { field: field.into(), value }
    }

    pub fn less_than(field: impl Into<String>, value: Decimal) -> Self {
        Self::LessThan { field: field.into(), value }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("field `{field}` is not numeric: `{found}`")]
    NotNumeric { field: String, found: String },
    #[error("condition evaluation failed: {0}")]
    Evaluation(String),
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &Condition, metadata: &Value) -> Result<bool, ConditionError>;
}

/// Evaluates [`Condition`] trees against JSON metadata. Fields are dotted
/// paths into nested objects (`budget.amount`). A missing field never
/// satisfies a comparison; a present but non-numeric field in a numeric
/// comparison is an error.
#[derive(Clone, Debug, Default)]
pub struct MetadataConditionEvaluator;

impl ConditionEvaluator for MetadataConditionEvaluator {
    fn evaluate(&self, condition: &Condition, metadata: &Value) -> Result<bool, ConditionError> {
        evaluate_condition(condition, metadata)
    }
}

fn evaluate_condition(condition: &Condition, metadata: &Value) -> Result<bool, ConditionError> {
    match condition {
        Condition::All { conditions } => {
            for inner in conditions {
                if !evaluate_condition(inner, metadata)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Any { conditions } => {
            for inner in conditions {
                if evaluate_condition(inner, metadata)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Not { condition } => Ok(!evaluate_condition(condition, metadata)?),
        Condition::Exists { field } => {
            Ok(lookup(metadata, field).map(|value| !value.is_null()).unwrap_or(false))
        }
        Condition::Equals { field, value } => {
            Ok(lookup(metadata, field).map(|found| values_equal(found, value)).unwrap_or(false))
        }
        Condition::NotEquals { field, value } => {
            Ok(lookup(metadata, field).map(|found| !values_equal(found, value)).unwrap_or(false))
        }
        Condition::In { field, values } => Ok(lookup(metadata, field)
            .map(|found| values.iter().any(|candidate| values_equal(found, candidate)))
            .unwrap_or(false)),
        Condition::GreaterThan { field, value } => compare(metadata, field, |found| found > *value),
        Condition::GreaterOrEqual { field, value } => {
            compare(metadata, field, |found| found >= *value)
        }
        Condition::LessThan { field, value } => compare(metadata, field, |found| found < *value),
        Condition::LessOrEqual { field, value } => {
            compare(metadata, field, |found| found <= *value)
        }
    }
}

fn lookup<'a>(metadata: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(metadata, |current, segment| current.as_object()?.get(segment))
}

fn compare<F>(metadata: &Value, field: &str, predicate: F) -> Result<bool, ConditionError>
where
    F: Fn(Decimal) -> bool,
{
    let Some(found) = lookup(metadata, field) else {
        return Ok(false);
    };
    if found.is_null() {
        return Ok(false);
    }

    let number = as_decimal(found).ok_or_else(|| ConditionError::NotNumeric {
        field: field.to_string(),
        found: found.to_string(),
    })?;
    Ok(predicate(number))
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string())
            .ok()
            .or_else(|| number.as_f64().and_then(Decimal::from_f64)),
        Value::String(raw) => Decimal::from_str(raw.trim()).ok(),
        _ => None,
    }
}

/// Numbers compare by value so `100` matches `100.0`; strings compare
/// case-insensitively after trimming.
fn values_equal(found: &Value, expected: &Value) -> bool {
    match (found, expected) {
        (Value::String(left), Value::String(right)) => {
            left.trim().eq_ignore_ascii_case(right.trim())
        }
        (Value::Number(_), Value::Number(_)) => as_decimal(found) == as_decimal(expected),
        _ => found == expected,
    }
}
