//! Scripts that need the host's own adapter process management.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use vsc_bridge_core::codes::ErrorCode;
use vsc_bridge_core::debug::{wait_until_paused, DebugSession, WaitOptions};
use vsc_bridge_core::registry::{parse_params, Field, ParamSchema};
use vsc_bridge_core::{Script, ScriptContext, ScriptError, ScriptKind, ScriptOutput};

use crate::dap::{DapSession, SessionSpec};
use crate::sessions::SessionManager;

pub fn host_scripts(sessions: Arc<SessionManager>, request_timeout: Duration) -> Vec<Arc<dyn Script>> {
    vec![
        Arc::new(StartSession {
            sessions: sessions.clone(),
            request_timeout,
        }),
        Arc::new(StopSession { sessions }),
    ]
}

/// Disconnect and kill a session, logging rather than failing.
async fn end_session(session: &DapSession, terminate_debuggee: bool) {
    if let Err(e) = session
        .request("disconnect", json!({ "terminateDebuggee": terminate_debuggee }))
        .await
    {
        tracing::warn!("Disconnect failed: session={}, error={}", session.id(), e);
    }
    session.shutdown();
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartParams {
    adapter: String,
    #[serde(default)]
    adapter_args: Vec<String>,
    #[serde(rename = "type")]
    session_type: String,
    name: Option<String>,
    request: String,
    #[serde(default)]
    configuration: Value,
    timeout_ms: u64,
    wait: bool,
}

pub struct StartSession {
    sessions: Arc<SessionManager>,
    request_timeout: Duration,
}

#[async_trait]
impl Script for StartSession {
    fn name(&self) -> &'static str {
        "debug.start"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Waitable
    }

    fn description(&self) -> &'static str {
        "Spawn a stdio debug adapter, launch or attach, and optionally wait for the first stop"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("adapter").required().describe("Adapter executable"))
            .field(Field::array("adapterArgs").default(json!([])))
            .field(Field::string("type").required().describe("Adapter type, e.g. node or python"))
            .field(Field::string("name"))
            .field(Field::one_of("request", &["launch", "attach"]).default("launch"))
            .field(Field::object("configuration").default(json!({})))
            .field(Field::integer("timeoutMs").default(30_000).min(100.0).max(300_000.0))
            .field(Field::boolean("wait").default(false))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: StartParams = parse_params(params)?;
        let bridge = &ctx.bridge;

        if let Some(previous) = self.sessions.take() {
            ctx.events
                .log("info", format!("Stopping previous session {}", previous.id()))
                .await;
            end_session(&previous, true).await;
            bridge.threads.invalidate(previous.id());
        }

        let spec = SessionSpec {
            id: uuid::Uuid::new_v4().to_string(),
            name: params.name.unwrap_or_else(|| params.session_type.clone()),
            session_type: params.session_type,
            request_timeout: self.request_timeout,
        };
        let session_id = spec.id.clone();
        bridge
            .capture
            .start_session(&session_id, &spec.session_type, &spec.name, None)
            .await;

        let session = match DapSession::spawn(&params.adapter, &params.adapter_args, spec, bridge.capture.clone()).await {
            Ok(session) => session,
            Err(e) => {
                bridge.capture.record_adapter_error(&session_id, &e.to_string()).await;
                return Err(ScriptError::new(ErrorCode::ScriptFailed, "Failed to start debug adapter")
                    .with_details(json!(e.to_string())));
            }
        };

        let capabilities = match session
            .start(&params.request, params.configuration, &bridge.breakpoints)
            .await
        {
            Ok(capabilities) => capabilities,
            Err(e) => {
                session.shutdown();
                return Err(e.into());
            }
        };
        self.sessions.set(session.clone());
        ctx.events
            .log("info", format!("Debug session {session_id} started"))
            .await;

        let mut result = json!({
            "sessionId": session_id,
            "type": session.session_type(),
            "name": session.name(),
            "capabilities": capabilities,
        });
        if params.wait {
            let outcome = wait_until_paused(
                self.sessions.as_ref(),
                &bridge.capture,
                Some(&session_id),
                WaitOptions::new(Duration::from_millis(params.timeout_ms)),
                &ctx.cancel,
            )
            .await?
            .into_result()?;
            result["outcome"] = serde_json::to_value(outcome).unwrap_or(Value::Null);
        }
        ScriptOutput::data(result)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopParams {
    terminate_debuggee: bool,
}

pub struct StopSession {
    sessions: Arc<SessionManager>,
}

#[async_trait]
impl Script for StopSession {
    fn name(&self) -> &'static str {
        "debug.stop"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Action
    }

    fn description(&self) -> &'static str {
        "Disconnect the active debug session and stop its adapter"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new().field(Field::boolean("terminateDebuggee").default(true))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: StopParams = parse_params(params)?;
        let session = self
            .sessions
            .take()
            .ok_or_else(|| ScriptError::from_code(ErrorCode::NoDebugSession))?;

        end_session(&session, params.terminate_debuggee).await;
        ctx.bridge.threads.invalidate(session.id());
        tracing::info!("Debug session stopped: id={}", session.id());

        ScriptOutput::data(json!({
            "sessionId": session.id(),
            "stopped": true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use vsc_bridge_core::envelope::{normalize_result, Meta};
    use vsc_bridge_core::{BridgeContext, CaptureStore, Envelope, Registry};

    struct Host {
        sessions: Arc<SessionManager>,
        ctx: ScriptContext,
    }

    fn host() -> Host {
        let sessions = Arc::new(SessionManager::new());
        let mut registry = Registry::with_builtin_scripts();
        for script in host_scripts(sessions.clone(), Duration::from_secs(2)) {
            registry.register(script).expect("register");
        }
        let workspace = std::env::temp_dir();
        let bridge = BridgeContext::new(workspace, sessions.clone(), Arc::new(CaptureStore::new()));
        let ctx = ScriptContext::detached(Arc::new(bridge), Arc::new(registry));
        Host { sessions, ctx }
    }

    async fn run(ctx: &ScriptContext, name: &str, params: Value) -> Envelope {
        let registry = ctx.registry.clone();
        let result = registry
            .dispatch(
                ctx.bridge.clone(),
                &ctx.request_id,
                name,
                params,
                ctx.cancel.clone(),
                ctx.events.clone(),
            )
            .await;
        normalize_result(result, Meta::new(ctx.request_id.clone(), Some(name), 0))
    }

    #[test]
    fn test_host_scripts_register_beside_builtins() {
        let host = host();
        assert!(host.ctx.registry.get("debug.start").is_some());
        assert!(host.ctx.registry.get("debug.stop").is_some());
        let mut registry = Registry::with_builtin_scripts();
        for script in host_scripts(host.sessions.clone(), Duration::from_secs(1)) {
            registry.register(script).expect("register");
        }
        let duplicate = host_scripts(host.sessions, Duration::from_secs(1)).remove(0);
        assert!(registry.register(duplicate).is_err());
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let host = host();
        let envelope = run(&host.ctx, "debug.stop", json!({})).await;
        assert_eq!(envelope.error_code(), Some("E_NO_DEBUG_SESSION"));
    }

    #[tokio::test]
    async fn test_start_with_missing_adapter_fails() {
        let host = host();
        let envelope = run(
            &host.ctx,
            "debug.start",
            json!({"adapter": "/nonexistent/debug-adapter", "type": "node"}),
        )
        .await;
        assert_eq!(envelope.error_code(), Some("E_SCRIPT_FAILED"));
        assert!(host.sessions.current().is_none());

        let captured = host.ctx.bridge.capture.sessions().await;
        assert_eq!(captured.len(), 1);
        let first = captured[0].outputs.front().expect("adapter error output");
        assert!(first.text.starts_with("[Adapter Error]"), "unexpected output: {}", first.text);
    }

    #[tokio::test]
    async fn test_start_requires_adapter_and_type() {
        let host = host();
        let envelope = run(&host.ctx, "debug.start", json!({"type": "node"})).await;
        assert_eq!(envelope.error_code(), Some("E_INVALID_PARAMS"));
    }

    fn fake_spec() -> SessionSpec {
        SessionSpec {
            id: "s1".into(),
            session_type: "node".into(),
            name: "Launch".into(),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_terminated_session_is_retired() {
        let host = host();
        let capture = host.ctx.bridge.capture.clone();
        capture.start_session("s1", "node", "Launch", None).await;
        let (client, adapter) = duplex(16 * 1024);
        let (client_read, client_write) = split(client);
        let session = DapSession::connect(client_read, Box::new(client_write), fake_spec(), capture.clone());
        host.sessions.set(session);

        let (_adapter_read, mut adapter_write) = split(adapter);
        let event = serde_json::to_vec(&json!({"seq": 1, "type": "event", "event": "terminated"})).expect("encode");
        adapter_write
            .write_all(format!("Content-Length: {}\r\n\r\n", event.len()).as_bytes())
            .await
            .expect("header");
        adapter_write.write_all(&event).await.expect("body");

        for _ in 0..100 {
            if capture.is_terminated("s1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(capture.is_terminated("s1").await, "terminated event never captured");

        let envelope = run(&host.ctx, "debug.status", json!({})).await;
        assert!(envelope.ok, "unexpected envelope: {envelope:?}");
        assert_eq!(envelope.data.expect("data")["isActive"], json!(false));
        assert!(host.sessions.take().is_none());

        let envelope = run(&host.ctx, "debug.stop", json!({})).await;
        assert_eq!(envelope.error_code(), Some("E_NO_DEBUG_SESSION"));
    }

    #[tokio::test]
    async fn test_closed_adapter_stream_is_retired() {
        let host = host();
        let (client, adapter) = duplex(16 * 1024);
        let (client_read, client_write) = split(client);
        let session = DapSession::connect(
            client_read,
            Box::new(client_write),
            fake_spec(),
            host.ctx.bridge.capture.clone(),
        );
        host.sessions.set(session.clone());
        drop(adapter);

        for _ in 0..100 {
            if session.is_ended() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.is_ended(), "session never noticed the closed stream");
        assert!(host.sessions.current().is_none());
    }

    #[tokio::test]
    async fn test_stop_sends_disconnect() {
        let host = host();
        let (client, adapter) = duplex(16 * 1024);
        let (client_read, client_write) = split(client);
        let session = DapSession::connect(client_read, Box::new(client_write), fake_spec(), host.ctx.bridge.capture.clone());
        host.sessions.set(session);

        let fake = tokio::spawn(async move {
            let (adapter_read, mut adapter_write) = split(adapter);
            let mut reader = BufReader::new(adapter_read);
            let mut length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.expect("header");
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some(value) = line.strip_prefix("Content-Length:") {
                    length = value.trim().parse().expect("length");
                }
            }
            let mut body = vec![0_u8; length];
            reader.read_exact(&mut body).await.expect("body");
            let request: Value = serde_json::from_slice(&body).expect("json");
            let response = serde_json::to_vec(&json!({
                "seq": 1,
                "type": "response",
                "request_seq": request["seq"],
                "command": "disconnect",
                "success": true,
            }))
            .expect("encode");
            adapter_write
                .write_all(format!("Content-Length: {}\r\n\r\n", response.len()).as_bytes())
                .await
                .expect("header");
            adapter_write.write_all(&response).await.expect("body");
            request
        });

        let envelope = run(&host.ctx, "debug.stop", json!({"terminateDebuggee": false})).await;
        assert!(envelope.ok, "unexpected envelope: {envelope:?}");
        assert_eq!(envelope.data.expect("data"), json!({"sessionId": "s1", "stopped": true}));
        assert!(host.sessions.current().is_none());

        let request = fake.await.expect("fake adapter");
        assert_eq!(request["command"], json!("disconnect"));
        assert_eq!(request["arguments"]["terminateDebuggee"], json!(false));
    }
}
