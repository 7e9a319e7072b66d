//! Edge-condition evaluation.
//!
//! Conditions guard edges during branching. The grammar is deliberately
//! small: a single comparison (`==`, `!=`, `>=`, `<=`, `>`, `<`) between
//! two operands, or a bare operand tested for truthiness. An operand is
//! either a dotted path into the run's working data (`check.score`,
//! rooted at a node id) or a literal.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Evaluate a condition against a run's working data.
pub fn evaluate(condition: &str, data: &BTreeMap<String, Value>) -> Result<bool> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Err(anyhow!("empty condition"));
    }

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some((left, right)) = condition.split_once(op) {
            let left = operand(left.trim(), data);
            let right = operand(right.trim(), data);
            return compare(op, &left, &right);
        }
    }

    // Bare operand: existence plus truthiness
    Ok(truthy(&operand(condition, data)))
}

/// Resolve a dotted path into the working data; fall back to a literal.
fn operand(token: &str, data: &BTreeMap<String, Value>) -> Value {
    if let Some(value) = resolve_path(token, data) {
        return value.clone();
    }
    if let Ok(b) = token.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = token.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Value::Number(num);
        }
    }
    Value::String(token.trim_matches('"').to_string())
}

fn resolve_path<'a>(path: &str, data: &'a BTreeMap<String, Value>) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare(op: &str, left: &Value, right: &Value) -> Result<bool> {
    // Numeric comparison when both sides are numbers, string otherwise
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return Ok(match op {
            "==" => l == r,
            "!=" => l != r,
            ">=" => l >= r,
            "<=" => l <= r,
            ">" => l > r,
            "<" => l < r,
            _ => return Err(anyhow!("unsupported operator {op}")),
        });
    }

    let l = as_text(left);
    let r = as_text(right);
    Ok(match op {
        "==" => l == r,
        "!=" => l != r,
        ">=" => l >= r,
        "<=" => l <= r,
        ">" => l > r,
        "<" => l < r,
        _ => return Err(anyhow!("unsupported operator {op}")),
    })
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert(
            "check".to_string(),
            json!({"score": 5, "status": "complete", "tags": []}),
        );
        map.insert("flag".to_string(), json!(true));
        map
    }

    #[test]
    fn equality_over_dotted_paths() {
        let d = data();
        assert!(evaluate("check.status == complete", &d).unwrap());
        assert!(!evaluate("check.status == pending", &d).unwrap());
        assert!(evaluate("check.status != pending", &d).unwrap());
    }

    #[test]
    fn numeric_comparisons() {
        let d = data();
        assert!(evaluate("check.score > 3", &d).unwrap());
        assert!(evaluate("check.score >= 5", &d).unwrap());
        assert!(evaluate("check.score < 10", &d).unwrap());
        assert!(!evaluate("check.score < 5", &d).unwrap());
    }

    #[test]
    fn bare_operand_is_truthiness() {
        let d = data();
        assert!(evaluate("flag", &d).unwrap());
        assert!(!evaluate("missing", &d).unwrap());
        assert!(!evaluate("check.tags", &d).unwrap());
    }

    #[test]
    fn unresolved_operands_compare_as_literals() {
        let d = data();
        assert!(evaluate("yes == yes", &d).unwrap());
        assert!(evaluate("2 < 10", &d).unwrap());
    }

    #[test]
    fn empty_condition_is_an_error() {
        assert!(evaluate("   ", &data()).is_err());
    }
}
