//! Secret redaction for job parameters.

use serde_json::{Map, Value};

/// Replacement for password-like values.
pub const MASK: &str = "********";

/// Return a copy of `params` that is safe to log and persist.
///
/// Keys containing `password` are masked; keys containing `user_data` are
/// replaced by the literal `user_data` (the payload is often large and may
/// embed credentials). Nested objects and arrays are walked.
pub fn redact(params: &Value) -> Value {
    match params {
        Value::Object(map) => Value::Object(redact_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn redact_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let lowered = key.to_ascii_lowercase();
            let value = if lowered.contains("password") {
                Value::String(MASK.to_string())
            } else if lowered.contains("user_data") {
                Value::String("user_data".to_string())
            } else {
                redact(value)
            };
            (key.clone(), value)
        })
        .collect()
}
