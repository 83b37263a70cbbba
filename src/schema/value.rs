//! Coercion of JSON attribute values into phrase payloads.

use serde_json::Value;

/// Integer reading of any JSON value. Strings parse their leading integer.
pub fn integer_value(value: &Value) -> i32 {
    match value {
        Value::Bool(true) => 1,
        Value::Number(n) => match n.as_i64() {
            Some(i) => i as i32,
            None => n.as_f64().map(|f| f as i32).unwrap_or(0),
        },
        Value::String(s) => leading_integer(s),
        _ => 0,
    }
}

/// Primary key reading: non-negative integers up to `u64::MAX`, as numbers or
/// decimal strings. Anything else is `None`.
pub fn key_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// String reading of any JSON value; containers collapse to their type name.
pub fn string_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => format!("{:.6}", n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => s.clone(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn leading_integer(text: &str) -> i32 {
    let text = text.trim_start();
    let digits_from = usize::from(text.starts_with(['-', '+']));
    let end = text[digits_from..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(text.len(), |i| i + digits_from);
    text[..end].parse::<i64>().map(|v| v as i32).unwrap_or(0)
}
