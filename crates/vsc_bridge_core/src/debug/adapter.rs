//! The seam to a live debug adapter: one request/response round trip plus
//! typed views over the handful of DAP bodies the state machine reads.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DapError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

impl Source {
    /// Path, else name, when either is non-empty.
    pub fn display_path(&self) -> Option<&str> {
        self.path
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(self.name.as_deref().filter(|n| !n.is_empty()))
    }

    pub fn is_resolvable(&self) -> bool {
        self.display_path().is_some() || self.source_reference.is_some_and(|r| r > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub column: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

impl StackFrame {
    pub fn file(&self) -> Option<&str> {
        self.source.as_ref().and_then(Source::display_path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    #[serde(default)]
    pub stack_frames: Vec<StackFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    #[serde(default)]
    pub expensive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_variables: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_variables: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_variables: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_variables: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_variables: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_variables: Option<i64>,
}

fn decode<T: DeserializeOwned>(command: &str, body: Value) -> Result<T, DapError> {
    serde_json::from_value(body)
        .map_err(|e| DapError::Transport(format!("Malformed '{command}' response body: {e}")))
}

/// One live debug session. Implementations send a request and resolve with
/// the response `body` or the adapter's failure.
#[async_trait]
pub trait DebugSession: Send + Sync {
    fn id(&self) -> &str;

    /// Adapter type, e.g. `node`, `python`, `coreclr`, `dart`.
    fn session_type(&self) -> &str;

    fn name(&self) -> &str;

    async fn request(&self, command: &str, args: Value) -> Result<Value, DapError>;

    async fn threads(&self) -> Result<Vec<Thread>, DapError> {
        let body = self.request("threads", json!({})).await?;
        let threads = body.get("threads").cloned().unwrap_or_else(|| json!([]));
        decode("threads", threads)
    }

    async fn stack_trace(&self, thread_id: i64, levels: i64) -> Result<StackTrace, DapError> {
        let body = self
            .request(
                "stackTrace",
                json!({ "threadId": thread_id, "startFrame": 0, "levels": levels }),
            )
            .await?;
        decode("stackTrace", body)
    }

    async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>, DapError> {
        let body = self.request("scopes", json!({ "frameId": frame_id })).await?;
        let scopes = body.get("scopes").cloned().unwrap_or_else(|| json!([]));
        decode("scopes", scopes)
    }

    async fn variables(
        &self,
        variables_reference: i64,
        start: i64,
        count: i64,
        filter: Option<&str>,
    ) -> Result<Vec<Variable>, DapError> {
        let mut args = json!({
            "variablesReference": variables_reference,
            "start": start,
            "count": count,
        });
        if let Some(filter) = filter {
            args["filter"] = json!(filter);
        }
        let body = self.request("variables", args).await?;
        let variables = body.get("variables").cloned().unwrap_or_else(|| json!([]));
        decode("variables", variables)
    }

    async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<EvaluateResult, DapError> {
        let mut args = json!({ "expression": expression, "context": context });
        if let Some(frame_id) = frame_id {
            args["frameId"] = json!(frame_id);
        }
        let body = self.request("evaluate", args).await?;
        decode("evaluate", body)
    }
}

/// Where scripts find the debug session they should act on.
pub trait SessionProvider: Send + Sync {
    /// The session the editor considers active, re-read on every call.
    fn active_session(&self) -> Option<Arc<dyn DebugSession>>;

    fn session(&self, session_id: &str) -> Option<Arc<dyn DebugSession>> {
        self.active_session().filter(|s| s.id() == session_id)
    }

    /// `session_id` when given, else the active session.
    fn resolve(&self, session_id: Option<&str>) -> Option<Arc<dyn DebugSession>> {
        match session_id {
            Some(id) => self.session(id),
            None => self.active_session(),
        }
    }
}

/// A provider with nothing attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSessions;

impl SessionProvider for NoSessions {
    fn active_session(&self) -> Option<Arc<dyn DebugSession>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::testing::MockSession;

    #[test]
    fn test_source_resolution() {
        let external = Source {
            name: Some(String::new()),
            ..Source::default()
        };
        assert!(!external.is_resolvable());

        let by_reference = Source {
            source_reference: Some(4),
            ..Source::default()
        };
        assert!(by_reference.is_resolvable());
        assert_eq!(by_reference.display_path(), None);

        let named = Source {
            name: Some("main.dart".into()),
            ..Source::default()
        };
        assert_eq!(named.display_path(), Some("main.dart"));
    }

    #[tokio::test]
    async fn test_typed_requests_decode_bodies() {
        let session = MockSession::new("s1", "node").on("threads", |_| {
            Ok(json!({"threads": [{"id": 1, "name": "main"}, {"id": 2}]}))
        });
        let session = session.on("stackTrace", |args| {
            assert_eq!(args["levels"], json!(1));
            Ok(json!({"stackFrames": [{"id": 10, "name": "run", "source": {"path": "/a.js"}, "line": 3, "column": 1}], "totalFrames": 7}))
        });

        let threads = session.threads().await.expect("threads");
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[1].name, "");

        let trace = session.stack_trace(1, 1).await.expect("stack trace");
        assert_eq!(trace.total_frames, Some(7));
        assert_eq!(trace.stack_frames[0].file(), Some("/a.js"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_transport_error() {
        let session = MockSession::new("s1", "node")
            .on("threads", |_| Ok(json!({"threads": [{"name": "no id"}]})));
        let err = session.threads().await.expect_err("malformed body");
        assert!(matches!(err, DapError::Transport(_)), "unexpected error: {err:?}");
    }

    #[test]
    fn test_provider_resolve() {
        let session: Arc<dyn DebugSession> = Arc::new(MockSession::new("s1", "node"));
        let provider = crate::debug::testing::StaticSessions::with(session);
        assert!(provider.resolve(None).is_some());
        assert!(provider.resolve(Some("s1")).is_some());
        assert!(provider.resolve(Some("other")).is_none());
        assert!(NoSessions.resolve(None).is_none());
    }
}
