use serde_json::{Map, Value};

/// Returns the substring from the first `{` to the last `}`, if any.
pub fn largest_brace_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

/// Parses a JSON object out of free-form model output.
///
/// Tries the whole trimmed text first, then the largest brace-delimited span
/// (which also covers markdown code fences and leading prose).
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let trimmed = raw.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Some(map);
    }

    let candidate = largest_brace_span(trimmed)?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Reads a number that a model may have emitted as a JSON number or a
/// numeric string.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }
    .filter(|number| number.is_finite())
}

pub fn field_f64(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(value_as_f64)
}

/// Non-empty trimmed string field.
pub fn field_text(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// String array field; a single string is accepted as a one-element list.
pub fn field_string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.trim().to_string()],
        _ => Vec::new(),
    }
}
