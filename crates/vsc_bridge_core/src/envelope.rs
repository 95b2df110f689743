//! The response envelope every operation produces, and the normalization of
//! handler outputs into it.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::codes::ErrorCode;
use crate::error::ScriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: None,
            hint: code.hint().map(str::to_string),
        }
    }
}

impl From<ScriptError> for ErrorBody {
    fn from(err: ScriptError) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message,
            details: err.details,
            hint: err.hint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub request_id: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    pub timestamp: String,
    pub duration_ms: u64,
}

fn default_mode() -> String {
    "normal".to_string()
}

impl Meta {
    pub fn new(request_id: impl Into<String>, script_name: Option<&str>, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            mode: default_mode(),
            script_name: script_name.map(str::to_string),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// `{ok, type, data|error, meta}`. Exactly one of `data`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Name of a sibling file holding `data` when it was too large to inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            kind: EnvelopeKind::Success,
            data: Some(data),
            data_ref: None,
            error: None,
            meta: None,
        }
    }

    pub fn failure(error: ErrorBody) -> Self {
        Self {
            ok: false,
            kind: EnvelopeKind::Error,
            data: None,
            data_ref: None,
            error: Some(error),
            meta: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(ErrorBody::new(code, message))
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// What a handler handed back, classified once at the dispatch boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutput {
    /// Already `{ok, type, data|error}`.
    Canonical {
        ok: bool,
        data: Option<Value>,
        error: Option<Value>,
    },
    /// `{success: true, ...rest}`.
    LegacySuccess(Map<String, Value>),
    /// `{success: false, reason?, errorCode?, details?, error?}`.
    LegacyFailure {
        reason: Option<String>,
        error_code: Option<String>,
        details: Option<Value>,
        error_message: Option<String>,
    },
    /// Anything else, including `null`.
    Value(Value),
}

impl ScriptOutput {
    /// Serialize a typed result as a plain data payload.
    pub fn data<T: Serialize>(value: T) -> Result<Self, ScriptError> {
        serde_json::to_value(value).map(ScriptOutput::Value).map_err(|e| {
            ScriptError::new(ErrorCode::Internal, format!("Failed to serialize result: {e}"))
        })
    }

    pub fn classify(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return ScriptOutput::Value(value);
        };

        if let Some(ok) = map.get("ok").and_then(Value::as_bool) {
            return ScriptOutput::Canonical {
                ok,
                data: map.remove("data"),
                error: map.remove("error"),
            };
        }

        match map.get("success").and_then(Value::as_bool) {
            Some(true) => {
                map.remove("success");
                ScriptOutput::LegacySuccess(map)
            }
            Some(false) => {
                let string_field = |map: &Map<String, Value>, key: &str| {
                    map.get(key).and_then(Value::as_str).map(str::to_string)
                };
                let error_message = match map.get("error") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Object(o)) => o.get("message").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                };
                ScriptOutput::LegacyFailure {
                    reason: string_field(&map, "reason"),
                    error_code: string_field(&map, "errorCode"),
                    details: map.remove("details"),
                    error_message,
                }
            }
            None => ScriptOutput::Value(Value::Object(map)),
        }
    }
}

impl From<Value> for ScriptOutput {
    fn from(value: Value) -> Self {
        ScriptOutput::classify(value)
    }
}

/// Reduce any handler output to exactly one envelope without nesting.
pub fn normalize(output: ScriptOutput) -> Envelope {
    match output {
        ScriptOutput::Canonical { ok: true, data, .. } => {
            Envelope::success(flatten_data(data.unwrap_or(Value::Null)))
        }
        ScriptOutput::Canonical { ok: false, error, .. } => {
            Envelope::failure(error_body_from_value(error))
        }
        ScriptOutput::LegacySuccess(rest) => Envelope::success(flatten_data(Value::Object(rest))),
        ScriptOutput::LegacyFailure {
            reason,
            error_code,
            details,
            error_message,
        } => {
            let reason_is_code = reason.as_deref().is_some_and(|r| r.starts_with("E_"));
            let code = error_code
                .or_else(|| reason.clone().filter(|_| reason_is_code))
                .unwrap_or_else(|| ErrorCode::Internal.as_str().to_string());
            let message = details
                .as_ref()
                .and_then(|d| d.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| reason.filter(|_| !reason_is_code))
                .or(error_message)
                .unwrap_or_else(|| default_message_for(&code));
            let hint = code.parse::<ErrorCode>().ok().and_then(|c| c.hint()).map(str::to_string);
            Envelope::failure(ErrorBody {
                code,
                message,
                details,
                hint,
            })
        }
        ScriptOutput::Value(Value::Null) => Envelope::success(json!({ "success": true })),
        ScriptOutput::Value(value) => Envelope::success(flatten_data(value)),
    }
}

/// Normalize a handler's result, attaching meta.
pub fn normalize_result(result: Result<ScriptOutput, ScriptError>, meta: Meta) -> Envelope {
    let envelope = match result {
        Ok(output) => normalize(output),
        Err(err) => Envelope::failure(err.into()),
    };
    envelope.with_meta(meta)
}

fn default_message_for(code: &str) -> String {
    code.parse::<ErrorCode>()
        .map(|c| c.default_message().to_string())
        .unwrap_or_else(|_| ErrorCode::Unknown.default_message().to_string())
}

fn is_wrapper(map: &Map<String, Value>) -> bool {
    let envelope_like = map.get("ok").is_some_and(Value::is_boolean) && map.contains_key("data");
    let data_only = map.len() == 1 && map.contains_key("data");
    envelope_like || data_only
}

// Strips accidental `{data: ...}` / inner-envelope wrappers so `data.data` never survives.
fn flatten_data(value: Value) -> Value {
    let mut current = value;
    while let Value::Object(map) = &mut current {
        if !is_wrapper(map) {
            break;
        }
        let inner = map.remove("data").unwrap_or(Value::Null);
        current = inner;
    }
    if current.is_null() {
        json!({ "success": true })
    } else {
        current
    }
}

fn error_body_from_value(error: Option<Value>) -> ErrorBody {
    let mut current = error.unwrap_or(Value::Null);
    while let Some(inner) = current.get("error").filter(|e| e.is_object()).cloned() {
        current = inner;
    }
    match current {
        Value::Object(map) => {
            let code = map
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or(ErrorCode::Internal.as_str())
                .to_string();
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| default_message_for(&code));
            ErrorBody {
                message,
                details: map.get("details").cloned(),
                hint: map.get("hint").and_then(Value::as_str).map(str::to_string),
                code,
            }
        }
        Value::String(message) => ErrorBody::new(ErrorCode::Internal, message),
        _ => ErrorBody::new(ErrorCode::Internal, ErrorCode::Internal.default_message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_flat(envelope: &Envelope) {
        if let Some(data) = &envelope.data {
            assert!(data.get("data").is_none(), "nested data: {data}");
        }
        if let Some(error) = &envelope.error {
            let value = serde_json::to_value(error).expect("serialize error");
            assert!(value.get("error").is_none(), "nested error: {value}");
        }
        assert_ne!(envelope.data.is_some(), envelope.error.is_some());
    }

    #[test]
    fn test_canonical_success_copied_one_level() {
        let envelope = normalize(json!({"ok": true, "type": "success", "data": {"x": 1}}).into());
        assert!(envelope.ok);
        assert_eq!(envelope.kind, EnvelopeKind::Success);
        assert_eq!(envelope.data, Some(json!({"x": 1})));
        assert_flat(&envelope);
    }

    #[test]
    fn test_double_wrapped_canonical_is_flattened() {
        let inner = json!({"ok": true, "type": "success", "data": {"x": 1}});
        let outer = json!({"ok": true, "type": "success", "data": inner});
        let envelope = normalize(outer.into());
        assert_eq!(envelope.data, Some(json!({"x": 1})));
        assert_flat(&envelope);
    }

    #[test]
    fn test_canonical_failure_copied() {
        let envelope = normalize(
            json!({"ok": false, "type": "error", "error": {"code": "E_NOT_FOUND", "message": "gone"}})
                .into(),
        );
        assert!(!envelope.ok);
        assert_eq!(envelope.error_code(), Some("E_NOT_FOUND"));
        assert_eq!(envelope.error.as_ref().map(|e| e.message.as_str()), Some("gone"));
        assert_flat(&envelope);
    }

    #[test]
    fn test_nested_error_is_flattened() {
        let envelope = normalize(
            json!({"ok": false, "error": {"error": {"code": "E_TIMEOUT", "message": "slow"}}}).into(),
        );
        assert_eq!(envelope.error_code(), Some("E_TIMEOUT"));
        assert_flat(&envelope);
    }

    #[test]
    fn test_legacy_success_uses_rest_of_object() {
        let envelope = normalize(json!({"success": true, "breakpoints": [], "total": 0}).into());
        assert!(envelope.ok);
        assert_eq!(envelope.data, Some(json!({"breakpoints": [], "total": 0})));

        let wrapped = normalize(json!({"success": true, "data": {"value": 3}}).into());
        assert_eq!(wrapped.data, Some(json!({"value": 3})));
        assert_flat(&wrapped);
    }

    #[test]
    fn test_legacy_failure_reason_code() {
        let envelope = normalize(
            json!({"success": false, "reason": "E_FILE_NOT_FOUND", "details": {"path": "/x"}}).into(),
        );
        let error = envelope.error.expect("error body");
        assert_eq!(error.code, "E_FILE_NOT_FOUND");
        assert_eq!(error.message, "File not found");
        assert_eq!(error.details, Some(json!({"path": "/x"})));
    }

    #[test]
    fn test_legacy_failure_message_precedence() {
        let envelope = normalize(
            json!({"success": false, "errorCode": "E_INVALID_LINE", "details": {"message": "line 0"}})
                .into(),
        );
        let error = envelope.error.expect("error body");
        assert_eq!(error.code, "E_INVALID_LINE");
        assert_eq!(error.message, "line 0");

        let prose = normalize(json!({"success": false, "reason": "adapter exploded"}).into());
        let error = prose.error.expect("error body");
        assert_eq!(error.code, "E_INTERNAL");
        assert_eq!(error.message, "adapter exploded");
    }

    #[test]
    fn test_bare_values_wrapped() {
        assert_eq!(normalize(Value::Null.into()).data, Some(json!({"success": true})));
        assert_eq!(normalize(json!(42).into()).data, Some(json!(42)));
        assert_eq!(normalize(json!([1, 2]).into()).data, Some(json!([1, 2])));
        let only_data = normalize(json!({"data": {"a": 1}}).into());
        assert_eq!(only_data.data, Some(json!({"a": 1})));
        assert_flat(&only_data);
    }

    #[test]
    fn test_handler_error_becomes_failure_with_meta() {
        let meta = Meta::new("req-1", Some("breakpoint.set"), 12);
        let envelope = normalize_result(
            Err(ScriptError::new(ErrorCode::InvalidLine, "bad")),
            meta.clone(),
        );
        assert_eq!(envelope.error_code(), Some("E_INVALID_LINE"));
        assert_eq!(envelope.meta, Some(meta));

        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "error");
        assert_eq!(value["meta"]["durationMs"], 12);
        assert_eq!(value["meta"]["mode"], "normal");
        assert!(value.get("data").is_none());
    }
}
