use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// Oldest outputs are dropped past this many per session.
pub const MAX_OUTPUTS_PER_SESSION: usize = 10_000;
/// Longer output text is cut to this many bytes.
pub const MAX_OUTPUT_TEXT_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEvent {
    pub ts: i64,
    pub category: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<OutputSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
}

impl OutputEvent {
    pub fn source_path(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|s| s.path.as_deref().or(s.name.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEvent {
    pub ts: i64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hit_breakpoint_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_threads_stopped: Option<bool>,
}

/// Exceptions carry no timestamp of their own.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_frames: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedSession {
    pub session_id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub outputs: VecDeque<OutputEvent>,
    pub exceptions: Vec<ExceptionRecord>,
    pub stopped_events: Vec<StoppedEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stopped_thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub terminated: bool,
    pub truncated: bool,
    pub dropped_outputs: usize,
}

impl CapturedSession {
    pub fn new(session_id: &str, session_type: &str, name: &str, start_time: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            session_type: session_type.to_string(),
            name: name.to_string(),
            parent_session_id: None,
            start_time,
            end_time: None,
            outputs: VecDeque::new(),
            exceptions: Vec::new(),
            stopped_events: Vec::new(),
            last_stopped_thread_id: None,
            exit_code: None,
            terminated: false,
            truncated: false,
            dropped_outputs: 0,
        }
    }

    /// Milliseconds from start to end, or to `now` while still running.
    pub fn duration_ms(&self, now: i64) -> i64 {
        (self.end_time.unwrap_or(now) - self.start_time).max(0)
    }

    fn push_output(&mut self, mut output: OutputEvent) {
        if output.text.len() > MAX_OUTPUT_TEXT_BYTES {
            let mut cut = MAX_OUTPUT_TEXT_BYTES;
            while !output.text.is_char_boundary(cut) {
                cut -= 1;
            }
            output.text.truncate(cut);
            self.truncated = true;
        }
        self.outputs.push_back(output);
        while self.outputs.len() > MAX_OUTPUTS_PER_SESSION {
            self.outputs.pop_front();
            self.dropped_outputs += 1;
            self.truncated = true;
        }
    }

    fn apply(&mut self, message: &Value, ts: i64) {
        if message.get("type").and_then(Value::as_str) != Some("event") {
            return;
        }
        let body = message.get("body").cloned().unwrap_or(Value::Null);
        let str_field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
        let int_field = |key: &str| body.get(key).and_then(Value::as_i64);

        match message.get("event").and_then(Value::as_str) {
            Some("output") => {
                let source = body.get("source").map(|s| OutputSource {
                    path: s.get("path").and_then(Value::as_str).map(str::to_string),
                    name: s.get("name").and_then(Value::as_str).map(str::to_string),
                });
                self.push_output(OutputEvent {
                    ts,
                    category: str_field("category").unwrap_or_else(|| "console".to_string()),
                    text: str_field("output").unwrap_or_default(),
                    source,
                    line: int_field("line"),
                    column: int_field("column"),
                });
            }
            Some("stopped") => {
                let stopped = StoppedEvent {
                    ts,
                    reason: str_field("reason").unwrap_or_else(|| "unknown".to_string()),
                    thread_id: int_field("threadId"),
                    text: str_field("text"),
                    description: str_field("description"),
                    hit_breakpoint_ids: body
                        .get("hitBreakpointIds")
                        .and_then(Value::as_array)
                        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                        .unwrap_or_default(),
                    all_threads_stopped: body.get("allThreadsStopped").and_then(Value::as_bool),
                };
                if stopped.reason == "exception" {
                    self.exceptions.push(ExceptionRecord {
                        thread_id: stopped.thread_id,
                        message: stopped.text.clone().unwrap_or_else(|| "Exception".to_string()),
                        description: stopped.description.clone(),
                        type_name: None,
                        stack_frames: None,
                    });
                }
                if stopped.thread_id.is_some() {
                    self.last_stopped_thread_id = stopped.thread_id;
                }
                self.stopped_events.push(stopped);
            }
            Some("exited") => {
                self.exit_code = int_field("exitCode");
                self.end_time = Some(ts);
            }
            Some("terminated") => {
                self.terminated = true;
                self.end_time = Some(ts);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    sessions: HashMap<String, CapturedSession>,
    // Insertion order breaks start-time ties.
    order: Vec<String>,
    last_session_id: Option<String>,
}

impl CaptureState {
    fn entry(&mut self, session_id: &str, ts: i64) -> &mut CapturedSession {
        if !self.sessions.contains_key(session_id) {
            self.order.push(session_id.to_string());
            self.last_session_id = Some(session_id.to_string());
        }
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| CapturedSession::new(session_id, "unknown", session_id, ts))
    }
}

/// Passive per-session recorder of adapter events.
#[derive(Debug, Default)]
pub struct CaptureStore {
    state: RwLock<CaptureState>,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl CaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_session(
        &self,
        session_id: &str,
        session_type: &str,
        name: &str,
        parent_session_id: Option<&str>,
    ) {
        self.start_session_at(session_id, session_type, name, parent_session_id, now_ms())
            .await;
    }

    pub async fn start_session_at(
        &self,
        session_id: &str,
        session_type: &str,
        name: &str,
        parent_session_id: Option<&str>,
        ts: i64,
    ) {
        let mut state = self.state.write().await;
        let session = state.entry(session_id, ts);
        session.session_type = session_type.to_string();
        session.name = name.to_string();
        session.parent_session_id = parent_session_id.map(str::to_string);
        tracing::debug!("Capturing session: id={}, type={}", session_id, session_type);
    }

    pub async fn record_message(&self, session_id: &str, message: &Value) {
        self.record_message_at(session_id, message, now_ms()).await;
    }

    /// Classify one adapter message into the session's record. Ignored once
    /// the session has terminated.
    pub async fn record_message_at(&self, session_id: &str, message: &Value, ts: i64) {
        let mut state = self.state.write().await;
        let session = state.entry(session_id, ts);
        if session.terminated {
            return;
        }
        session.apply(message, ts);
    }

    /// Adapter process exit. Does not override an `exited` event's code.
    pub async fn record_adapter_exit(&self, session_id: &str, exit_code: Option<i64>) {
        let ts = now_ms();
        let mut state = self.state.write().await;
        let session = state.entry(session_id, ts);
        if session.exit_code.is_none() {
            session.exit_code = exit_code;
        }
        if session.end_time.is_none() {
            session.end_time = Some(ts);
        }
    }

    pub async fn record_adapter_error(&self, session_id: &str, message: &str) {
        let ts = now_ms();
        let mut state = self.state.write().await;
        let session = state.entry(session_id, ts);
        if session.terminated {
            return;
        }
        session.push_output(OutputEvent {
            ts,
            category: "stderr".to_string(),
            text: format!("[Adapter Error] {message}"),
            source: None,
            line: None,
            column: None,
        });
    }

    /// A session by id, or the most recently started one.
    pub async fn session(&self, session_id: Option<&str>) -> Option<CapturedSession> {
        let state = self.state.read().await;
        let id = session_id.map(str::to_string).or_else(|| state.last_session_id.clone())?;
        state.sessions.get(&id).cloned()
    }

    /// Every captured session, newest first.
    pub async fn sessions(&self) -> Vec<CapturedSession> {
        let state = self.state.read().await;
        let mut sessions: Vec<(usize, &CapturedSession)> = state
            .order
            .iter()
            .enumerate()
            .filter_map(|(i, id)| state.sessions.get(id).map(|s| (i, s)))
            .collect();
        sessions.sort_by(|(ia, a), (ib, b)| b.start_time.cmp(&a.start_time).then(ib.cmp(ia)));
        sessions.into_iter().map(|(_, s)| s.clone()).collect()
    }

    pub async fn last_session_id(&self) -> Option<String> {
        self.state.read().await.last_session_id.clone()
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = CaptureState::default();
    }

    pub async fn stop_count(&self, session_id: &str) -> usize {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .map_or(0, |s| s.stopped_events.len())
    }

    /// Thread of the latest stop and how many stops the session has seen.
    pub async fn last_stop(&self, session_id: &str) -> Option<(i64, usize)> {
        let state = self.state.read().await;
        let session = state.sessions.get(session_id)?;
        Some((session.last_stopped_thread_id?, session.stopped_events.len()))
    }

    pub async fn is_terminated(&self, session_id: &str) -> bool {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .is_some_and(|s| s.terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(category: &str, text: &str) -> Value {
        json!({"type": "event", "event": "output", "body": {"category": category, "output": text}})
    }

    #[tokio::test]
    async fn test_classifies_events() {
        let store = CaptureStore::new();
        store.start_session_at("s1", "node", "Launch", None, 1_000).await;
        store.record_message_at("s1", &output("stdout", "hello"), 1_010).await;
        store
            .record_message_at("s1", &json!({"type": "event", "event": "output", "body": {"output": "no category"}}), 1_020)
            .await;
        store
            .record_message_at(
                "s1",
                &json!({"type": "event", "event": "stopped", "body": {"reason": "exception", "threadId": 7, "text": "TypeError", "description": "x is undefined"}}),
                1_030,
            )
            .await;
        store
            .record_message_at("s1", &json!({"type": "event", "event": "exited", "body": {"exitCode": 2}}), 1_040)
            .await;
        store
            .record_message_at("s1", &json!({"type": "response", "command": "threads"}), 1_045)
            .await;

        let session = store.session(None).await.expect("session");
        assert_eq!(session.outputs.len(), 2);
        assert_eq!(session.outputs[1].category, "console");
        assert_eq!(session.stopped_events.len(), 1);
        assert_eq!(session.exceptions.len(), 1);
        assert_eq!(session.exceptions[0].message, "TypeError");
        assert_eq!(session.last_stopped_thread_id, Some(7));
        assert_eq!(session.exit_code, Some(2));
        assert_eq!(session.end_time, Some(1_040));
        assert!(!session.terminated);
    }

    #[tokio::test]
    async fn test_terminated_freezes_record() {
        let store = CaptureStore::new();
        store.start_session("s1", "node", "Launch", None).await;
        store
            .record_message("s1", &json!({"type": "event", "event": "terminated", "body": {}}))
            .await;
        store.record_message("s1", &output("stdout", "late")).await;
        store.record_adapter_error("s1", "late error").await;

        let session = store.session(Some("s1")).await.expect("session");
        assert!(session.terminated);
        assert!(session.outputs.is_empty());
        assert!(store.is_terminated("s1").await);
    }

    #[tokio::test]
    async fn test_adapter_exit_keeps_event_exit_code() {
        let store = CaptureStore::new();
        store.start_session("s1", "python", "Run", None).await;
        store
            .record_message("s1", &json!({"type": "event", "event": "exited", "body": {"exitCode": 3}}))
            .await;
        store.record_adapter_exit("s1", Some(0)).await;
        store.record_adapter_error("s1", "pipe closed").await;

        let session = store.session(Some("s1")).await.expect("session");
        assert_eq!(session.exit_code, Some(3));
        assert_eq!(session.outputs[0].category, "stderr");
        assert_eq!(session.outputs[0].text, "[Adapter Error] pipe closed");
    }

    #[tokio::test]
    async fn test_output_cap_sets_truncated() {
        let store = CaptureStore::new();
        store.start_session("s1", "node", "Launch", None).await;
        for i in 0..(MAX_OUTPUTS_PER_SESSION + 5) {
            store.record_message("s1", &output("stdout", &format!("line {i}"))).await;
        }
        store.record_message("s1", &output("stdout", &"x".repeat(MAX_OUTPUT_TEXT_BYTES + 1))).await;

        let session = store.session(Some("s1")).await.expect("session");
        assert_eq!(session.outputs.len(), MAX_OUTPUTS_PER_SESSION);
        assert_eq!(session.dropped_outputs, 6);
        assert!(session.truncated);
        assert_eq!(session.outputs[0].text, "line 6");
        assert_eq!(session.outputs.back().map(|o| o.text.len()), Some(MAX_OUTPUT_TEXT_BYTES));
    }

    #[tokio::test]
    async fn test_sessions_newest_first_and_clear() {
        let store = CaptureStore::new();
        store.start_session_at("old", "node", "a", None, 100).await;
        store.start_session_at("new", "node", "b", Some("old"), 200).await;

        let ids: Vec<String> = store.sessions().await.into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
        assert_eq!(store.last_session_id().await.as_deref(), Some("new"));
        assert_eq!(
            store.session(Some("new")).await.and_then(|s| s.parent_session_id),
            Some("old".to_string())
        );

        store.clear().await;
        assert!(store.sessions().await.is_empty());
        assert!(store.session(None).await.is_none());
    }

    #[tokio::test]
    async fn test_last_stop_tracks_generation() {
        let store = CaptureStore::new();
        store.start_session("s1", "node", "Launch", None).await;
        assert_eq!(store.last_stop("s1").await, None);
        for thread in [1, 4] {
            store
                .record_message(
                    "s1",
                    &json!({"type": "event", "event": "stopped", "body": {"reason": "breakpoint", "threadId": thread}}),
                )
                .await;
        }
        assert_eq!(store.last_stop("s1").await, Some((4, 2)));
        assert_eq!(store.stop_count("s1").await, 2);
    }
}
