//! One-line human rendering of envelopes for terminals.

use serde_json::Value;

use crate::envelope::Envelope;

const SMALL_OBJECT_KEYS: usize = 3;

/// Rendered text plus whether it reads as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub failed: bool,
}

pub fn render(envelope: &Envelope) -> Rendered {
    if !envelope.ok {
        let Some(error) = &envelope.error else {
            return failed("✗ Unknown error".to_string(), None);
        };
        let mut text = format!("✗ [{}] {}", error.code, error.message);
        if let Some(Value::String(details)) = &error.details {
            text.push_str(": ");
            text.push_str(details);
        }
        return failed(text, error.hint.as_deref());
    }

    let data = envelope.data.as_ref().unwrap_or(&Value::Null);
    if data.get("success").and_then(Value::as_bool) == Some(false) {
        return failed(format!("✗ {}", legacy_failure(data)), None);
    }
    Rendered {
        text: format!("✓ {}", summarize(data)),
        failed: false,
    }
}

fn failed(mut text: String, hint: Option<&str>) -> Rendered {
    if let Some(hint) = hint {
        text.push_str("\nHint: ");
        text.push_str(hint);
    }
    Rendered { text, failed: true }
}

fn known_message(code: &str) -> Option<&'static str> {
    match code {
        "E_FILE_NOT_FOUND" => Some("File not found"),
        "E_INVALID_LINE" => Some("Invalid line number"),
        "E_INVALID_PATH" => Some("Invalid file path"),
        "E_NO_DEBUG_SESSION" => Some("No active debug session"),
        "E_SCRIPT_NOT_FOUND" => Some("Script not found"),
        "E_INVALID_PARAMS" => Some("Invalid parameters"),
        _ => None,
    }
}

/// `{success: false, reason, details}` from hosts that predate envelopes.
fn legacy_failure(data: &Value) -> String {
    let mut text = match data.get("reason").and_then(Value::as_str) {
        Some(reason) if reason.starts_with("E_") => match known_message(reason) {
            Some(message) => format!("[{reason}] {message}"),
            None => format!("[{reason}]"),
        },
        Some(reason) => reason.to_string(),
        None => "Operation failed".to_string(),
    };
    let detail = match data.get("details") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(details) => details
            .get("path")
            .or_else(|| details.get("message"))
            .and_then(Value::as_str),
        None => None,
    };
    if let Some(detail) = detail {
        text.push_str(": ");
        text.push_str(detail);
    }
    text
}

fn summarize(data: &Value) -> String {
    match data {
        Value::Null => "Success".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => data.to_string(),
        Value::Array(items) => format!("{} item(s)", items.len()),
        Value::Object(map) => {
            if let Some(bp) = map.get("breakpoint") {
                let path = bp.get("path").and_then(Value::as_str).unwrap_or("?");
                let line = bp.get("line").map_or_else(|| "?".to_string(), Value::to_string);
                return format!("Breakpoint set at {path}:{line}");
            }
            if let Some(cleared) = map.get("cleared").and_then(Value::as_u64) {
                return format!("Cleared {cleared} breakpoint(s)");
            }
            if let Some(total) = map.get("total").and_then(Value::as_u64) {
                return format!("{total} items");
            }
            if map.len() <= SMALL_OBJECT_KEYS {
                return data.to_string();
            }
            format!("Object with {} properties", map.len())
        }
    }
}
