use crate::value::{Map, Value};

/// Make a value tree safe for JSON serialization.
///
/// Non-finite floats become the strings `"NaN"`, `"Infinity"` and
/// `"-Infinity"`; every other leaf is returned unchanged. Total and
/// idempotent.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Float(f) if f.is_nan() => Value::String("NaN".to_string()),
        Value::Float(f) if f == f64::INFINITY => Value::String("Infinity".to_string()),
        Value::Float(f) if f == f64::NEG_INFINITY => Value::String("-Infinity".to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(sanitize_map(map)),
        other => other,
    }
}

pub fn sanitize_map(map: Map) -> Map {
    map.into_iter().map(|(k, v)| (k, sanitize(v))).collect()
}
