//! Decoding structured data out of agent responses.
//!
//! Agents answer with JSON, YAML, fenced markdown blocks, or plain prose.
//! Everything here turns such an answer into a `serde_json::Value` or a typed
//! structure.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

/// Contents of the first fenced block (```yaml, ```json, or bare ```), or the
/// whole text when there is no fence. A leading `---` is dropped.
pub fn extract_block(text: &str) -> String {
    let body = match text.find("```") {
        Some(open) => {
            let after_fence = &text[open + 3..];
            // Skip the info string (yaml, json, ...) up to the end of the line
            let content_start = after_fence.find('\n').map(|n| n + 1).unwrap_or(0);
            let content = &after_fence[content_start..];
            match content.find("```") {
                Some(close) => &content[..close],
                None => content,
            }
        }
        None => text,
    };

    clean_yaml(body)
}

/// Strip the document separator and surrounding whitespace
pub fn clean_yaml(yaml: &str) -> String {
    yaml.trim().trim_start_matches("---").trim().to_string()
}

/// Best-effort structured view of a raw agent answer.
///
/// JSON first, then YAML mappings/sequences; anything else (including YAML that
/// only parses as a bare scalar) comes back as a JSON string.
pub fn response_value(raw: &str) -> Value {
    let block = extract_block(raw);

    if let Ok(value) = serde_json::from_str::<Value>(&block) {
        return value;
    }

    match serde_yaml::from_str::<Value>(&block) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(raw.trim().to_string()),
    }
}

/// Decode an executor result into `T`, unwrapping string answers first
pub fn decode_response<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let structured = match value {
        Value::String(text) => response_value(text),
        other => other.clone(),
    };
    Ok(serde_json::from_value(structured)?)
}
