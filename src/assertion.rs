//! Assertion evaluation.
//!
//! [`check`] compares one actual value against an expected value with
//! an operator. [`evaluate_all`] runs a step's assertion list against a
//! captured response.

use crate::context::Context;
use crate::model::{Assertion, AssertionKind, Operator};
use crate::path;
use crate::template;
use serde_json::Value;
use tracing::debug;

/// Compare `actual` against `expected`.
///
/// A null or empty `expected` never passes. The string `"null"` (any
/// case) stands for JSON null, and strings that look like a JSON array
/// or object are parsed before comparing.
pub fn check(actual: &Value, operator: Operator, expected: &Value) -> bool {
    if is_blank(expected) {
        return false;
    }
    let expected = normalize_expected(expected);

    match operator {
        Operator::Eq => loose_eq(actual, &expected),
        Operator::Ne => !loose_eq(actual, &expected),
        Operator::Gt => compare(actual, &expected, |a, e| a > e),
        Operator::Gte => compare(actual, &expected, |a, e| a >= e),
        Operator::Lt => compare(actual, &expected, |a, e| a < e),
        Operator::Lte => compare(actual, &expected, |a, e| a <= e),
        Operator::Contains => {
            template::stringify(actual).contains(&template::stringify(&expected))
        }
        Operator::NotContains => {
            !template::stringify(actual).contains(&template::stringify(&expected))
        }
        _ => false,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn normalize_expected(expected: &Value) -> Value {
    let Value::String(raw) = expected else {
        return expected.clone();
    };

    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return parsed;
        }
    }
    expected.clone()
}

/// Equality with numeric-string coercion when exactly one side is a
/// number.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(_), Value::String(s)) => match numeric_string(s) {
            Some(n) => numbers_equal(actual, &n),
            None => false,
        },
        (Value::String(s), Value::Number(_)) => match numeric_string(s) {
            Some(n) => numbers_equal(&n, expected),
            None => false,
        },
        _ => deep_eq(actual, expected),
    }
}

/// Parse a numeric-looking string: float when it contains `.`,
/// integer otherwise.
fn numeric_string(s: &str) -> Option<Value> {
    let s = s.trim();
    if s.contains('.') {
        s.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
    } else {
        s.parse::<i64>().ok().map(Value::from)
    }
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            x.as_f64() == y.as_f64()
        }
        _ => false,
    }
}

/// Structural equality where `1` equals `1.0` at any depth.
fn deep_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => numbers_equal(a, b),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_eq(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| deep_eq(v, other)))
        }
        _ => a == b,
    }
}

fn compare(actual: &Value, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_f64(actual), as_f64(expected)) {
        (Some(a), Some(e)) => op(a, e),
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// The parts of a response assertions look at.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: u16,
    /// Milliseconds.
    pub response_time: u64,
    pub json: Option<&'a Value>,
    pub text: &'a str,
}

/// Outcome of an assertion list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssertionReport {
    pub passed: bool,
    pub failures: Vec<String>,
}

impl AssertionReport {
    /// Failure messages joined by newlines, `None` when nothing failed.
    pub fn error_message(&self) -> Option<String> {
        (!self.failures.is_empty()).then(|| self.failures.join("\n"))
    }
}

/// Evaluate `assertions` against a response.
///
/// With no assertions a response passes when its status is 2xx.
/// Entries without a type or operator are ignored, as are types this
/// evaluator does not implement. Each `expected` is rendered against
/// `ctx` first.
pub fn evaluate_all(
    assertions: &[Assertion],
    response: &ResponseView<'_>,
    ctx: &Context,
) -> AssertionReport {
    if assertions.is_empty() {
        return AssertionReport {
            passed: (200..300).contains(&response.status),
            failures: Vec::new(),
        };
    }

    let mut failures = Vec::new();
    for assertion in assertions {
        let (Some(kind), Some(operator)) = (assertion.kind, assertion.operator) else {
            continue;
        };
        let expected = template::render(&assertion.expected, ctx);

        if let Some(failure) = evaluate_one(kind, operator, assertion, expected, response) {
            debug!("Assertion failed: {failure}");
            failures.push(failure);
        }
    }

    AssertionReport {
        passed: failures.is_empty(),
        failures,
    }
}

fn evaluate_one(
    kind: AssertionKind,
    operator: Operator,
    assertion: &Assertion,
    expected: Value,
    response: &ResponseView<'_>,
) -> Option<String> {
    match kind {
        AssertionKind::StatusCode => {
            if is_blank(&expected) {
                return Some("status code assertion: expected value is empty".to_string());
            }
            let expected = template::stringify(&expected).trim().to_string();
            let actual = Value::from(response.status);
            (!check(&actual, operator, &Value::String(expected.clone()))).then(|| {
                format!(
                    "status code assertion failed: expected {expected}, actual {}",
                    response.status
                )
            })
        }
        AssertionKind::JsonPath => {
            let target = assertion.target.as_deref().filter(|t| !t.is_empty());
            let (Some(json), Some(target)) = (response.json.filter(|j| is_truthy(j)), target)
            else {
                return Some(format!(
                    "json path assertion failed: cannot extract path {}",
                    assertion.target.as_deref().unwrap_or_default()
                ));
            };

            let expected = strip_quotes(expected);
            let actual = path::lookup(json, target);
            (!check(&actual, operator, &expected)).then(|| {
                format!(
                    "json path assertion failed: {target} expected {}, actual {}",
                    template::stringify(&expected),
                    template::stringify(&actual)
                )
            })
        }
        AssertionKind::ResponseTime => {
            let actual = Value::from(response.response_time);
            (!check(&actual, operator, &expected)).then(|| {
                format!(
                    "response time assertion failed: expected {}ms, actual {}ms",
                    template::stringify(&expected),
                    response.response_time
                )
            })
        }
        AssertionKind::Contains => {
            if is_blank(&expected) {
                return None;
            }
            let needle = template::stringify(&expected);
            (!response.text.contains(&needle)).then(|| {
                format!("contains assertion failed: response body does not contain {needle}")
            })
        }
        other => {
            debug!("Skipping unsupported assertion type {other:?}");
            None
        }
    }
}

/// Rendering may wrap a string in one pair of JSON quotes.
fn strip_quotes(value: Value) -> Value {
    match value {
        Value::String(s) if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') => {
            Value::String(s[1..s.len() - 1].to_string())
        }
        other => other,
    }
}

/// Truthiness of a decoded body: null, false, zero and empty values are
/// falsy.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
