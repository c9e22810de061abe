//! Threshold comparison for `json_threshold` checks.
//!
//! Thresholds may be authored as plain numbers or as numeric strings. A string
//! holding an integer literal compares both sides as integers (fractional
//! values truncate toward zero). Any other numeric threshold compares as
//! floating point. Non-numeric thresholds only support `==` / `!=`, which
//! compare JSON values directly.
//! Every failure to compare is an `Err` with a human-readable reason, which the
//! check engine turns into a failed check.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::Operator;

static DECIMAL_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").unwrap());
static INTEGER_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[+-]?\d+$").unwrap());

/// Evaluate `actual <operator> expected`.
pub fn compare(actual: &Value, operator: Operator, expected: &Value) -> Result<bool, String> {
    if let Some(threshold) = integer_threshold(expected) {
        let value = integer_value(actual)
            .ok_or_else(|| format!("value {actual} is not an integer"))?;
        return Ok(apply(operator, value, threshold));
    }
    if let Some(threshold) = numeric_threshold(expected) {
        let value = numeric_value(actual)
            .ok_or_else(|| format!("value {actual} is not numeric"))?;
        return Ok(apply(operator, value, threshold));
    }

    if !operator.is_equality() {
        return Err(format!(
            "threshold {expected} is not numeric; operator {operator} requires numbers"
        ));
    }
    let equal = actual == expected;
    Ok(match operator {
        Operator::Eq => equal,
        _ => !equal,
    })
}

/// Interpret the configured threshold as a number, if it is one.
pub fn numeric_threshold(expected: &Value) -> Option<f64> {
    match expected {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => parse_decimal(raw),
        _ => None,
    }
}

/// Coerce an artifact value to a number. Booleans and non-literal strings are not numeric.
pub fn numeric_value(actual: &Value) -> Option<f64> {
    match actual {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => parse_decimal(raw),
        _ => None,
    }
}

fn integer_threshold(expected: &Value) -> Option<i128> {
    match expected {
        Value::String(raw) => parse_integer(raw),
        _ => None,
    }
}

/// Integer view of an artifact value; fractional numbers truncate toward zero.
fn integer_value(actual: &Value) -> Option<i128> {
    match actual {
        Value::Number(number) => number
            .as_i64()
            .map(i128::from)
            .or_else(|| number.as_u64().map(i128::from))
            .or_else(|| number.as_f64().map(|value| value.trunc() as i128)),
        Value::String(raw) => parse_integer(raw),
        _ => None,
    }
}

fn parse_integer(raw: &str) -> Option<i128> {
    let trimmed = raw.trim();
    if !INTEGER_LITERAL.is_match(trimmed) {
        return None;
    }
    trimmed.parse::<i128>().ok()
}

fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if !DECIMAL_LITERAL.is_match(trimmed) {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

fn apply<T: PartialOrd>(operator: Operator, left: T, right: T) -> bool {
    match operator {
        Operator::Ge => left >= right,
        Operator::Gt => left > right,
        Operator::Le => left <= right,
        Operator::Lt => left < right,
        Operator::Eq => left == right,
        Operator::Ne => left != right,
    }
}

/// Resolve `key` in a JSON document: exact top-level key first, then a dotted path.
pub fn lookup<'a>(document: &'a Value, key: &str) -> Option<&'a Value> {
    let object = document.as_object()?;
    if let Some(value) = object.get(key) {
        return Some(value);
    }
    if !key.contains('.') {
        return None;
    }
    key.split('.')
        .try_fold(document, |current, segment| current.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_threshold_passes_and_fails() {
        let actual = json!(0.92);
        assert_eq!(compare(&actual, Operator::Ge, &json!(0.9)), Ok(true));
        assert_eq!(compare(&actual, Operator::Ge, &json!("0.95")), Ok(false));
        assert_eq!(compare(&actual, Operator::Lt, &json!(1)), Ok(true));
    }

    #[test]
    fn string_values_are_coerced_when_threshold_is_numeric() {
        assert_eq!(compare(&json!("12"), Operator::Gt, &json!("10")), Ok(true));
        assert_eq!(compare(&json!(" 3.5 "), Operator::Eq, &json!(3.5)), Ok(true));
    }

    #[test]
    fn integer_string_threshold_truncates_fractional_values() {
        assert_eq!(compare(&json!(1.5), Operator::Gt, &json!("1")), Ok(false));
        assert_eq!(compare(&json!(1.5), Operator::Eq, &json!("1")), Ok(true));
        assert_eq!(compare(&json!(-2.7), Operator::Eq, &json!("-2")), Ok(true));
        assert_eq!(compare(&json!(100), Operator::Eq, &json!("100")), Ok(true));
        assert_eq!(compare(&json!(" 7 "), Operator::Ge, &json!("7")), Ok(true));
    }

    #[test]
    fn integer_string_threshold_rejects_non_integer_strings() {
        let err = compare(&json!("1.5"), Operator::Gt, &json!("1")).unwrap_err();
        assert!(err.contains("not an integer"), "{err}");
        assert!(compare(&json!(false), Operator::Eq, &json!("0")).is_err());
    }

    #[test]
    fn number_threshold_keeps_fractional_precision() {
        assert_eq!(compare(&json!(1.5), Operator::Gt, &json!(1)), Ok(true));
        assert_eq!(compare(&json!(1.5), Operator::Gt, &json!("1.0")), Ok(true));
    }

    #[test]
    fn non_numeric_value_fails_closed() {
        let err = compare(&json!("n/a"), Operator::Ge, &json!(0.5)).unwrap_err();
        assert!(err.contains("not numeric"));
        assert!(compare(&json!(true), Operator::Ge, &json!(1)).is_err());
    }

    #[test]
    fn ordering_against_non_numeric_threshold_is_rejected() {
        let err = compare(&json!("b"), Operator::Gt, &json!("a")).unwrap_err();
        assert!(err.contains("requires numbers"));
    }

    #[test]
    fn equality_on_non_numeric_values() {
        assert_eq!(compare(&json!("done"), Operator::Eq, &json!("done")), Ok(true));
        assert_eq!(compare(&json!("done"), Operator::Ne, &json!("done")), Ok(false));
        assert_eq!(compare(&json!(true), Operator::Eq, &json!(true)), Ok(true));
    }

    #[test]
    fn lookup_prefers_exact_key_then_dotted_path() {
        let doc = json!({
            "metrics.accuracy": 0.5,
            "metrics": {"accuracy": 0.9, "loss": 0.1},
        });
        assert_eq!(lookup(&doc, "metrics.accuracy"), Some(&json!(0.5)));
        assert_eq!(lookup(&doc, "metrics.loss"), Some(&json!(0.1)));
        assert_eq!(lookup(&doc, "metrics.f1"), None);
        assert_eq!(lookup(&json!([1, 2]), "0"), None);
    }

    #[test]
    fn decimal_literal_detection() {
        assert_eq!(numeric_threshold(&json!("0.95")), Some(0.95));
        assert_eq!(numeric_threshold(&json!("-3")), Some(-3.0));
        assert_eq!(numeric_threshold(&json!("1e-3")), Some(0.001));
        assert_eq!(numeric_threshold(&json!("inf")), None);
        assert_eq!(numeric_threshold(&json!("0.9x")), None);
        assert_eq!(numeric_threshold(&json!(null)), None);
    }
}
