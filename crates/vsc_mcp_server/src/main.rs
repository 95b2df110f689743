use std::time::Duration;

use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use vsc_bridge_core::transport::check_health;
use vsc_bridge_core::{BridgeClient, BridgeConfig, Envelope};

/// Headroom the client keeps beyond a waitable script's own timeout.
const WAIT_HEADROOM: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct NoParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct RunScriptParams {
    /// Registered script name, e.g. `debug.stack`.
    script: String,
    #[serde(default)]
    params: Option<Value>,
    /// Overall timeout; defaults to the bridge timeout.
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct SetBreakpointParams {
    path: String,
    line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct StartParams {
    /// Debug adapter executable speaking DAP over stdio.
    adapter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    adapter_args: Option<Vec<String>>,
    #[serde(rename = "type")]
    session_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// `launch` or `attach`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    configuration: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct WaitParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct EvaluateParams {
    expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frame_id: Option<i64>,
    /// `repl`, `watch` or `hover`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ListVariablesParams {
    /// `local`, `closure`, `global` or `all`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    /// Expansion depth, 0 to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_children: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct SummaryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compact: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct LogsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    /// `stdout`, `stderr`, `console`, `telemetry` or `all`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    /// Case-insensitive regex over output text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ExceptionsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
}

#[derive(Clone)]
struct VscMcpServer {
    tool_router: ToolRouter<Self>,
    client: BridgeClient,
}

/// Client timeout for a call: the bridge default, stretched past a
/// script-side wait so the script times out first.
fn client_timeout(default: Duration, script_wait_ms: Option<u64>) -> Duration {
    match script_wait_ms {
        Some(ms) => default.max(Duration::from_millis(ms) + WAIT_HEADROOM),
        None => default,
    }
}

/// Failure envelopes come back as tool errors carrying the whole envelope.
fn tool_result(envelope: &Envelope) -> Result<CallToolResult, McpError> {
    let value = serde_json::to_value(envelope)
        .map_err(|e| McpError::internal_error(format!("Failed to encode envelope: {}", e), None))?;
    if envelope.ok {
        Ok(CallToolResult::structured(value))
    } else {
        Ok(CallToolResult::structured_error(value))
    }
}

fn to_params<P: Serialize>(params: &P) -> Result<Value, McpError> {
    serde_json::to_value(params).map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e), None))
}

#[tool_router]
impl VscMcpServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            client: BridgeClient::new(BridgeConfig::from_env()),
        }
    }

    async fn call(&self, script: &str, params: Value, wait_ms: Option<u64>) -> Result<CallToolResult, McpError> {
        let timeout = client_timeout(self.client.config().timeout, wait_ms);
        tracing::debug!("Forwarding tool call: script={}, timeout_ms={}", script, timeout.as_millis());
        let envelope = self
            .client
            .run_command(script, params, timeout, &Default::default())
            .await;
        tool_result(&envelope)
    }

    #[tool(description = "Check whether a bridge host is serving this workspace")]
    async fn bridge_status(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        let root = self
            .client
            .bridge_root()
            .map_err(|e| McpError::internal_error(format!("Bridge not found: {}", e), None))?;
        let health = check_health(&root).await;
        Ok(CallToolResult::structured(json!({
            "bridgeRoot": root.display().to_string(),
            "healthy": health.healthy,
            "host": health.host,
            "diagnostic": health.diagnostic,
        })))
    }

    #[tool(description = "List every script the bridge host serves, with parameter schemas")]
    async fn bridge_list_scripts(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        self.call("script.list", json!({}), None).await
    }

    #[tool(description = "Run any bridge script by name (see bridge_list_scripts)")]
    async fn bridge_run_script(&self, params: Parameters<RunScriptParams>) -> Result<CallToolResult, McpError> {
        let RunScriptParams {
            script,
            params,
            timeout_ms,
        } = params.0;
        let wait_ms = params
            .as_ref()
            .and_then(|p| p.get("timeoutMs"))
            .and_then(Value::as_u64)
            .or(timeout_ms);
        self.call(&script, params.unwrap_or_else(|| json!({})), wait_ms).await
    }

    #[tool(description = "Set a breakpoint at a file line, optionally conditional or as a logpoint")]
    async fn breakpoint_set(&self, params: Parameters<SetBreakpointParams>) -> Result<CallToolResult, McpError> {
        self.call("breakpoint.set", to_params(&params.0)?, None).await
    }

    #[tool(description = "List all breakpoints")]
    async fn breakpoint_list(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        self.call("breakpoint.list", json!({}), None).await
    }

    #[tool(description = "Start a debug session by spawning a stdio debug adapter")]
    async fn debug_start(&self, params: Parameters<StartParams>) -> Result<CallToolResult, McpError> {
        let wait_ms = params.0.timeout_ms;
        self.call("debug.start", to_params(&params.0)?, wait_ms).await
    }

    #[tool(description = "Wait until the debuggee pauses at a breakpoint or terminates")]
    async fn debug_wait_for_hit(&self, params: Parameters<WaitParams>) -> Result<CallToolResult, McpError> {
        let wait_ms = params.0.timeout_ms.or(Some(30_000));
        self.call("debug.wait-for-hit", to_params(&params.0)?, wait_ms).await
    }

    #[tool(description = "Snapshot of the active session: paused thread, stack and scopes")]
    async fn debug_status(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        self.call("debug.status", json!({}), None).await
    }

    #[tool(description = "Resume execution and wait for the next stop or termination")]
    async fn debug_continue(&self, params: Parameters<WaitParams>) -> Result<CallToolResult, McpError> {
        let wait_ms = params.0.timeout_ms.or(Some(30_000));
        self.call("debug.continue", to_params(&params.0)?, wait_ms).await
    }

    #[tool(description = "Step over the current line and wait for the next stop")]
    async fn debug_step_over(&self, params: Parameters<WaitParams>) -> Result<CallToolResult, McpError> {
        let wait_ms = params.0.timeout_ms.or(Some(5_000));
        self.call("debug.step-over", to_params(&params.0)?, wait_ms).await
    }

    #[tool(description = "Evaluate an expression in the paused frame")]
    async fn debug_evaluate(&self, params: Parameters<EvaluateParams>) -> Result<CallToolResult, McpError> {
        self.call("debug.evaluate", to_params(&params.0)?, None).await
    }

    #[tool(description = "Variables of the paused frame, expanded to maxDepth within a memory budget")]
    async fn debug_list_variables(&self, params: Parameters<ListVariablesParams>) -> Result<CallToolResult, McpError> {
        self.call("debug.list-variables", to_params(&params.0)?, None).await
    }

    #[tool(description = "Disconnect the active debug session")]
    async fn debug_stop(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        self.call("debug.stop", json!({}), None).await
    }

    #[tool(description = "Summarize a captured session: counts, health and samples")]
    async fn dap_summary(&self, params: Parameters<SummaryParams>) -> Result<CallToolResult, McpError> {
        self.call("dap.summary", to_params(&params.0)?, None).await
    }

    #[tool(description = "Recent debuggee output from a captured session")]
    async fn dap_logs(&self, params: Parameters<LogsParams>) -> Result<CallToolResult, McpError> {
        self.call("dap.logs", to_params(&params.0)?, None).await
    }

    #[tool(description = "Exceptions seen in a captured session, with surrounding output")]
    async fn dap_exceptions(&self, params: Parameters<ExceptionsParams>) -> Result<CallToolResult, McpError> {
        self.call("dap.exceptions", to_params(&params.0)?, None).await
    }
}

#[tool_handler]
impl ServerHandler for VscMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Drives an editor debugger through the filesystem bridge; a bridge host must be running".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries MCP framing.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let server = VscMcpServer::new();
    let transport = transport::stdio();

    tracing::info!("Starting VSC Bridge MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsc_bridge_core::ErrorCode;

    #[test]
    fn test_client_timeout_outlasts_script_wait() {
        let default = Duration::from_secs(30);
        assert_eq!(client_timeout(default, None), default);
        assert_eq!(client_timeout(default, Some(1_000)), default);
        assert_eq!(client_timeout(default, Some(60_000)), Duration::from_secs(65));
    }

    #[test]
    fn test_failure_envelope_is_tool_error() {
        let failed = tool_result(&Envelope::error(ErrorCode::NoDebugSession, "No active debug session")).expect("result");
        assert_eq!(failed.is_error, Some(true));
        let ok = tool_result(&Envelope::success(json!({"total": 0}))).expect("result");
        assert_ne!(ok.is_error, Some(true));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let params = to_params(&SetBreakpointParams {
            path: "src/app.js".into(),
            line: 12,
            condition: None,
            hit_condition: Some("3".into()),
            log_message: None,
        })
        .expect("params");
        assert_eq!(params, json!({"path": "src/app.js", "line": 12, "hitCondition": "3"}));
    }
}
