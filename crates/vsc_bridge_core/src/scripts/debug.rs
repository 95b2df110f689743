use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::codes::ErrorCode;
use crate::context::ScriptContext;
use crate::debug::{
    resolve_active_thread, snapshot, wait_for_next_stop, wait_until_paused, BudgetLimit, DebugSession,
    ExpandOptions, MemoryBudget, ScopeFilter, VariableWalker, WaitOptions, SNAPSHOT_LEVELS,
};
use crate::envelope::ScriptOutput;
use crate::error::{DapError, ScriptError};
use crate::registry::{parse_params, Field, ParamSchema, Script, ScriptKind};

pub struct Status;

#[async_trait]
impl Script for Status {
    fn name(&self) -> &'static str {
        "debug.status"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Snapshot of the active debug session: paused thread, stack, and scopes"
    }

    async fn run(&self, ctx: ScriptContext, _params: Value) -> Result<ScriptOutput, ScriptError> {
        let snapshot = snapshot(ctx.bridge.sessions.as_ref(), true).await?;
        ScriptOutput::data(snapshot)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitParams {
    timeout_ms: u64,
}

pub struct WaitForHit;

#[async_trait]
impl Script for WaitForHit {
    fn name(&self) -> &'static str {
        "debug.wait-for-hit"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Waitable
    }

    fn description(&self) -> &'static str {
        "Wait until a debug session pauses at a breakpoint or terminates"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new().field(
            Field::integer("timeoutMs")
                .default(30_000)
                .min(100.0)
                .max(300_000.0),
        )
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: WaitParams = parse_params(params)?;
        let outcome = wait_until_paused(
            ctx.bridge.sessions.as_ref(),
            &ctx.bridge.capture,
            None,
            WaitOptions::new(Duration::from_millis(params.timeout_ms)),
            &ctx.cancel,
        )
        .await?;
        ScriptOutput::data(outcome.into_result()?)
    }
}

/// Execution commands that resume the debuggee and wait for it to stop
/// again. One value per DAP command.
pub struct Step {
    name: &'static str,
    command: &'static str,
    description: &'static str,
    every_thread: bool,
    default_timeout_ms: u64,
    max_timeout_ms: u64,
}

impl Step {
    pub const CONTINUE: Step = Step {
        name: "debug.continue",
        command: "continue",
        description: "Resume execution and wait for the next stop or termination",
        every_thread: true,
        default_timeout_ms: 30_000,
        max_timeout_ms: 300_000,
    };

    pub const OVER: Step = Step {
        name: "debug.step-over",
        command: "next",
        description: "Step over the current line and wait for the next stop",
        every_thread: false,
        default_timeout_ms: 5_000,
        max_timeout_ms: 10_000,
    };

    pub const INTO: Step = Step {
        name: "debug.step-into",
        command: "stepIn",
        description: "Step into the call on the current line and wait for the next stop",
        every_thread: false,
        default_timeout_ms: 5_000,
        max_timeout_ms: 10_000,
    };

    pub const OUT: Step = Step {
        name: "debug.step-out",
        command: "stepOut",
        description: "Run to the end of the current function and wait for the next stop",
        every_thread: false,
        default_timeout_ms: 5_000,
        max_timeout_ms: 10_000,
    };

    /// Dart isolates pause independently, so steps go to each of them.
    fn targets_every_thread(&self, session_type: &str) -> bool {
        self.every_thread || session_type == "dart"
    }

    async fn send(&self, ctx: &ScriptContext, session: &dyn DebugSession) -> Result<(), ScriptError> {
        if !self.targets_every_thread(session.session_type()) {
            let thread = resolve_active_thread(session, &ctx.bridge.capture, &ctx.bridge.threads).await?;
            session
                .request(self.command, json!({ "threadId": thread.thread_id }))
                .await?;
            return Ok(());
        }

        let threads = session.threads().await?;
        if threads.is_empty() {
            return Err(ScriptError::from_code(ErrorCode::NoThreads));
        }
        // Threads that are not paused reject the command; one acceptance is enough.
        let mut first_error = None;
        let mut accepted = 0;
        for thread in &threads {
            match session.request(self.command, json!({ "threadId": thread.id })).await {
                Ok(_) => accepted += 1,
                Err(e) => {
                    tracing::debug!("Thread rejected {}: thread={}, error={}", self.command, thread.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match (accepted, first_error) {
            (0, Some(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepParams {
    session_id: Option<String>,
    timeout_ms: u64,
}

#[async_trait]
impl Script for Step {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Waitable
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new().field(Field::string("sessionId")).field(
            Field::integer("timeoutMs")
                .default(self.default_timeout_ms)
                .min(1.0)
                .max(self.max_timeout_ms as f64),
        )
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: StepParams = parse_params(params)?;
        let session = ctx.bridge.session(params.session_id.as_deref())?;
        let capture = &ctx.bridge.capture;

        let baseline = capture.stop_count(session.id()).await;
        self.send(&ctx, session.as_ref()).await?;
        ctx.bridge.threads.invalidate(session.id());

        let outcome = wait_for_next_stop(
            session.as_ref(),
            ctx.bridge.sessions.as_ref(),
            capture,
            &ctx.bridge.threads,
            baseline,
            WaitOptions::new(Duration::from_millis(params.timeout_ms)),
            &ctx.cancel,
        )
        .await?;
        ScriptOutput::data(outcome.into_result()?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: Option<String>,
}

pub struct Threads;

#[async_trait]
impl Script for Threads {
    fn name(&self) -> &'static str {
        "debug.threads"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "List the threads of the debug session"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new().field(Field::string("sessionId"))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: SessionParams = parse_params(params)?;
        let session = ctx.bridge.session(params.session_id.as_deref())?;
        let threads = session.threads().await?;
        let total = threads.len();
        ScriptOutput::data(json!({ "threads": threads, "total": total }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackParams {
    session_id: Option<String>,
    thread_id: Option<i64>,
    levels: i64,
}

pub struct Stack;

#[async_trait]
impl Script for Stack {
    fn name(&self) -> &'static str {
        "debug.stack"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Call stack of a paused thread, the stopped thread by default"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::integer("threadId"))
            .field(Field::integer("levels").default(SNAPSHOT_LEVELS).min(1.0))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: StackParams = parse_params(params)?;
        let session = ctx.bridge.session(params.session_id.as_deref())?;
        let thread_id = match params.thread_id {
            Some(id) => id,
            None => {
                resolve_active_thread(session.as_ref(), &ctx.bridge.capture, &ctx.bridge.threads)
                    .await?
                    .thread_id
            }
        };
        let trace = session.stack_trace(thread_id, params.levels).await?;
        ScriptOutput::data(json!({
            "threadId": thread_id,
            "stackFrames": trace.stack_frames,
            "totalFrames": trace.total_frames,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesParams {
    session_id: Option<String>,
    frame_id: i64,
}

pub struct Scopes;

#[async_trait]
impl Script for Scopes {
    fn name(&self) -> &'static str {
        "debug.scopes"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Variable scopes of a stack frame"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::integer("frameId").required())
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: ScopesParams = parse_params(params)?;
        let session = ctx.bridge.session(params.session_id.as_deref())?;
        let scopes = session.scopes(params.frame_id).await?;
        ScriptOutput::data(json!({ "frameId": params.frame_id, "scopes": scopes }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateParams {
    session_id: Option<String>,
    expression: String,
    frame_id: Option<i64>,
    context: String,
}

pub struct Evaluate;

#[async_trait]
impl Script for Evaluate {
    fn name(&self) -> &'static str {
        "debug.evaluate"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Evaluate an expression in a stack frame, the top frame of the stopped thread by default"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::string("expression").required())
            .field(Field::integer("frameId"))
            .field(Field::one_of("context", &["repl", "watch", "hover"]).default("repl"))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: EvaluateParams = parse_params(params)?;
        let session = ctx.bridge.session(params.session_id.as_deref())?;

        let frame_id = match params.frame_id {
            Some(id) => Some(id),
            None => resolve_active_thread(session.as_ref(), &ctx.bridge.capture, &ctx.bridge.threads)
                .await
                .ok()
                .and_then(|thread| thread.top_frame)
                .map(|frame| frame.id),
        };

        let result = session
            .evaluate(&params.expression, frame_id, &params.context)
            .await
            .map_err(|e| match e {
                DapError::Request { message, .. } => ScriptError::new(
                    ErrorCode::EvaluateFailed,
                    format!("Failed to evaluate expression: {message}"),
                )
                .with_details(json!({ "expression": params.expression })),
                other => other.into(),
            })?;

        ScriptOutput::data(json!({
            "result": result.result,
            "type": result.type_name,
            "variablesReference": result.variables_reference,
            "namedVariables": result.named_variables,
            "indexedVariables": result.indexed_variables,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetVariableParams {
    session_id: Option<String>,
    variables_reference: i64,
    start: i64,
    count: i64,
    filter: String,
}

/// Largest page `debug.get-variable` serves in one request.
const MAX_PAGE: i64 = 10_000;

pub struct GetVariable;

#[async_trait]
impl Script for GetVariable {
    fn name(&self) -> &'static str {
        "debug.get-variable"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Children of a structured variable, one page at a time"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::integer("variablesReference").required())
            .field(Field::integer("start").default(0).min(0.0))
            .field(Field::integer("count").default(100).min(1.0).max(MAX_PAGE as f64))
            .field(Field::one_of("filter", &["all", "named", "indexed"]).default("all"))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: GetVariableParams = parse_params(params)?;
        if params.variables_reference <= 0 {
            return Err(ScriptError::new(
                ErrorCode::InvalidParams,
                "Invalid variablesReference (must be > 0)",
            )
            .with_details(json!({ "variablesReference": params.variables_reference })));
        }
        let session = ctx.bridge.session(params.session_id.as_deref())?;
        let filter = (params.filter != "all").then_some(params.filter.as_str());

        // One extra child tells whether another page exists.
        let mut children = session
            .variables(params.variables_reference, params.start, params.count.saturating_add(1), filter)
            .await
            .map_err(|e| match e {
                DapError::Request { message, .. } => ScriptError::new(
                    ErrorCode::InvalidReference,
                    format!("Failed to read variables: {message}"),
                )
                .with_details(json!({ "variablesReference": params.variables_reference })),
                other => other.into(),
            })?;
        let has_more = children.len() as i64 > params.count;
        children.truncate(params.count as usize);

        ScriptOutput::data(json!({
            "children": children,
            "pagination": {
                "start": params.start,
                "count": params.count,
                "shown": children.len(),
                "hasMore": has_more,
            },
            "metadata": {
                "sessionId": session.id(),
                "sessionType": session.session_type(),
                "variablesReference": params.variables_reference,
                "filter": params.filter,
            },
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListVariablesParams {
    session_id: Option<String>,
    frame_id: Option<i64>,
    scope: String,
    max_depth: usize,
    max_children: i64,
    include_expensive: bool,
}

pub struct ListVariables;

#[async_trait]
impl Script for ListVariables {
    fn name(&self) -> &'static str {
        "debug.list-variables"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "Variables of a paused frame, expanded to maxDepth within a node and size budget"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::integer("frameId"))
            .field(Field::one_of("scope", &["local", "closure", "global", "all"]).default("all"))
            .field(Field::integer("maxDepth").default(3).min(0.0).max(10.0))
            .field(Field::integer("maxChildren").default(50).min(1.0).max(1_000.0))
            .field(Field::boolean("includeExpensive").default(false))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: ListVariablesParams = parse_params(params)?;
        let filter = ScopeFilter::parse(&params.scope)
            .ok_or_else(|| ScriptError::new(ErrorCode::InvalidParams, format!("Unknown scope '{}'", params.scope)))?;
        let session = ctx.bridge.session(params.session_id.as_deref())?;

        let frame_id = match params.frame_id {
            Some(id) => id,
            None => resolve_active_thread(session.as_ref(), &ctx.bridge.capture, &ctx.bridge.threads)
                .await?
                .top_frame
                .map(|frame| frame.id)
                .ok_or_else(|| ScriptError::from_code(ErrorCode::NoStack))?,
        };

        let options = ExpandOptions {
            max_depth: params.max_depth,
            max_children: params.max_children,
            include_expensive: params.include_expensive,
            filter,
        };
        let mut walker = VariableWalker::new(session.as_ref(), options, MemoryBudget::default());
        let scopes = walker.list_frame(frame_id).await?;
        let budget = walker.budget().status();

        if let Some(limit) = budget.exceeded {
            tracing::debug!("Variable listing over budget: session={}, limit={:?}", session.id(), limit);
            let (code, message) = match limit {
                BudgetLimit::NodeLimit => (
                    ErrorCode::MemoryBudgetExceeded,
                    format!("Memory budget exceeded after {} variables", budget.nodes),
                ),
                BudgetLimit::ByteLimit => (
                    ErrorCode::LargeData,
                    format!("Variable data is too large: {} nodes, {} bytes", budget.nodes, budget.bytes),
                ),
            };
            return Err(ScriptError::new(code, message)
                .with_details(json!({ "budget": budget, "partialData": scopes })));
        }

        let variable_count = scopes.len();
        ScriptOutput::data(json!({
            "variables": scopes,
            "metadata": {
                "sessionId": session.id(),
                "sessionType": session.session_type(),
                "frameId": frame_id,
                "scope": params.scope,
                "maxDepth": params.max_depth,
                "variableCount": variable_count,
                "budget": budget,
            },
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetVariableParams {
    session_id: Option<String>,
    variables_reference: i64,
    name: String,
    value: String,
}

pub struct SetVariable;

#[async_trait]
impl Script for SetVariable {
    fn name(&self) -> &'static str {
        "debug.set-variable"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Action
    }

    fn description(&self) -> &'static str {
        "Assign a new value to a variable in a paused frame"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("sessionId"))
            .field(Field::integer("variablesReference").required().min(1.0))
            .field(Field::string("name").required())
            .field(Field::string("value").required())
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: SetVariableParams = parse_params(params)?;
        let session = ctx.bridge.session(params.session_id.as_deref())?;

        let body = session
            .request(
                "setVariable",
                json!({
                    "variablesReference": params.variables_reference,
                    "name": params.name,
                    "value": params.value,
                }),
            )
            .await
            .map_err(|e| match e {
                DapError::Request { message, .. } => {
                    let lower = message.to_lowercase();
                    let code = if lower.contains("read-only") || lower.contains("readonly") || lower.contains("read only") {
                        ErrorCode::ReadOnly
                    } else {
                        ErrorCode::ModificationFailed
                    };
                    ScriptError::new(code, format!("Failed to set variable '{}': {message}", params.name))
                        .with_details(json!({ "name": params.name }))
                }
                other => other.into(),
            })?;

        ScriptOutput::data(json!({
            "value": body.get("value").cloned().unwrap_or_else(|| json!(params.value)),
            "type": body.get("type"),
            "variablesReference": body.get("variablesReference").cloned().unwrap_or(json!(0)),
            "namedVariables": body.get("namedVariables"),
            "indexedVariables": body.get("indexedVariables"),
            "metadata": {
                "sessionId": session.id(),
                "sessionType": session.session_type(),
                "name": params.name,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capture::CaptureStore;
    use crate::debug::testing::{MockSession, StaticSessions};
    use crate::debug::NoSessions;
    use crate::scripts::test_support::{context, run};

    fn frame(id: i64, line: i64) -> Value {
        json!({"id": id, "name": "main", "source": {"path": "/app/main.js"}, "line": line, "column": 1})
    }

    fn paused_session(session_type: &str) -> MockSession {
        MockSession::new("s1", session_type)
            .on("threads", |_| Ok(json!({"threads": [{"id": 1, "name": "main"}, {"id": 2, "name": "worker"}]})))
            .on("stackTrace", |args| match args["threadId"].as_i64() {
                Some(1) => Ok(json!({"stackFrames": [frame(100, 7)], "totalFrames": 1})),
                _ => Err(DapError::request("stackTrace", "Thread is not paused")),
            })
            .on("scopes", |_| Ok(json!({"scopes": [{"name": "Locals", "variablesReference": 9}]})))
    }

    async fn stopped_capture() -> Arc<CaptureStore> {
        let capture = Arc::new(CaptureStore::new());
        capture.start_session("s1", "node", "Launch", None).await;
        capture
            .record_message("s1", &json!({"type": "event", "event": "stopped", "body": {"reason": "breakpoint", "threadId": 1}}))
            .await;
        capture
    }

    fn stop_soon(capture: Arc<CaptureStore>) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            capture
                .record_message("s1", &json!({"type": "event", "event": "stopped", "body": {"reason": "step", "threadId": 1}}))
                .await;
        });
    }

    #[tokio::test]
    async fn test_status_without_session() {
        let ctx = context("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "debug.status", json!({})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["isActive"], json!(false));
        assert_eq!(data["isPaused"], json!(false));
    }

    #[tokio::test]
    async fn test_status_reports_location_and_scopes() {
        let session = Arc::new(paused_session("node"));
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "debug.status", json!({})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["isPaused"], json!(true));
        assert_eq!(data["currentLocation"]["line"], json!(7));
        assert_eq!(data["scopes"][0]["name"], json!("Locals"));
    }

    #[tokio::test]
    async fn test_wait_for_hit_times_out_without_session() {
        let ctx = context("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "debug.wait-for-hit", json!({"timeoutMs": 100})).await;
        assert_eq!(envelope.error_code(), Some("E_TIMEOUT"));
        let error = envelope.error.expect("error");
        assert!(error.hint.is_some(), "missing hint: {error:?}");
    }

    #[tokio::test]
    async fn test_wait_for_hit_rejects_tiny_timeout() {
        let ctx = context("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "debug.wait-for-hit", json!({"timeoutMs": 5})).await;
        assert_eq!(envelope.error_code(), Some("E_INVALID_PARAMS"));
    }

    #[tokio::test]
    async fn test_step_over_targets_stopped_thread() {
        let session = Arc::new(paused_session("node").on("next", |_| Ok(json!({}))));
        let capture = stopped_capture().await;
        let ctx = context("/work", Arc::new(StaticSessions::with(session.clone())), capture.clone());
        stop_soon(capture);

        let envelope = run(&ctx, "debug.step-over", json!({})).await;
        assert!(envelope.ok, "unexpected envelope: {envelope:?}");
        let data = envelope.data.expect("data");
        assert_eq!(data["event"], json!("stopped"));
        assert_eq!(data["line"], json!(7));

        let next: Vec<_> = session.requests().into_iter().filter(|(c, _)| c == "next").collect();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].1["threadId"], json!(1));
    }

    #[tokio::test]
    async fn test_dart_steps_every_isolate() {
        let session = Arc::new(paused_session("dart").on("stepIn", |args| match args["threadId"].as_i64() {
            Some(1) => Ok(json!({})),
            _ => Err(DapError::request("stepIn", "Isolate is not paused")),
        }));
        let capture = stopped_capture().await;
        let ctx = context("/work", Arc::new(StaticSessions::with(session.clone())), capture.clone());
        stop_soon(capture);

        let envelope = run(&ctx, "debug.step-into", json!({})).await;
        assert!(envelope.ok, "unexpected envelope: {envelope:?}");
        assert_eq!(session.count("stepIn"), 2);
    }

    #[tokio::test]
    async fn test_continue_reports_termination() {
        let session = Arc::new(paused_session("node").on("continue", |_| Ok(json!({"allThreadsContinued": true}))));
        let capture = stopped_capture().await;
        let ctx = context("/work", Arc::new(StaticSessions::with(session.clone())), capture.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            capture
                .record_message("s1", &json!({"type": "event", "event": "exited", "body": {"exitCode": 0}}))
                .await;
            capture
                .record_message("s1", &json!({"type": "event", "event": "terminated", "body": {}}))
                .await;
        });

        let envelope = run(&ctx, "debug.continue", json!({"timeoutMs": 2000})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["event"], json!("terminated"));
        assert_eq!(data["exitCode"], json!(0));
        assert_eq!(session.count("continue"), 2);
    }

    #[tokio::test]
    async fn test_step_without_session() {
        let ctx = context("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "debug.step-out", json!({})).await;
        assert_eq!(envelope.error_code(), Some("E_NO_DEBUG_SESSION"));
    }

    #[tokio::test]
    async fn test_evaluate_defaults_to_top_frame() {
        let session = Arc::new(paused_session("node").on("evaluate", |args| {
            Ok(json!({"result": format!("frame {}", args["frameId"]), "type": "string", "variablesReference": 0}))
        }));
        let capture = stopped_capture().await;
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), capture);
        let envelope = run(&ctx, "debug.evaluate", json!({"expression": "a + b"})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["result"], json!("frame 100"));
        assert_eq!(data["type"], json!("string"));
    }

    #[tokio::test]
    async fn test_evaluate_failure() {
        let session = Arc::new(
            paused_session("node").on("evaluate", |_| Err(DapError::request("evaluate", "x is not defined"))),
        );
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), stopped_capture().await);
        let envelope = run(&ctx, "debug.evaluate", json!({"expression": "x", "frameId": 100})).await;
        assert_eq!(envelope.error_code(), Some("E_EVALUATE_FAILED"));
        let error = envelope.error.expect("error");
        assert!(error.message.contains("x is not defined"), "unexpected message: {}", error.message);
    }

    #[tokio::test]
    async fn test_get_variable_paginates() {
        let session = Arc::new(paused_session("node").on("variables", |args| {
            let start = args["start"].as_i64().unwrap_or(0);
            let count = args["count"].as_i64().unwrap_or(0);
            let children: Vec<Value> = (start..(start + count).min(25))
                .map(|i| json!({"name": format!("[{i}]"), "value": i.to_string(), "variablesReference": 0}))
                .collect();
            Ok(json!({"variables": children}))
        }));
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), Arc::new(CaptureStore::new()));

        let envelope = run(&ctx, "debug.get-variable", json!({"variablesReference": 9, "count": 10})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["pagination"], json!({"start": 0, "count": 10, "shown": 10, "hasMore": true}));

        let envelope = run(&ctx, "debug.get-variable", json!({"variablesReference": 9, "start": 20, "count": 10})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["pagination"]["shown"], json!(5));
        assert_eq!(data["pagination"]["hasMore"], json!(false));
        assert_eq!(data["children"][0]["name"], json!("[20]"));
    }

    #[tokio::test]
    async fn test_get_variable_rejects_zero_reference() {
        let ctx = context("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "debug.get-variable", json!({"variablesReference": 0})).await;
        assert_eq!(envelope.error_code(), Some("E_INVALID_PARAMS"));
    }

    #[tokio::test]
    async fn test_get_variable_rejects_oversized_page() {
        let session = Arc::new(paused_session("node").on("variables", |_| Ok(json!({"variables": []}))));
        let ctx = context("/work", Arc::new(StaticSessions::with(session.clone())), Arc::new(CaptureStore::new()));

        let envelope = run(&ctx, "debug.get-variable", json!({"variablesReference": 9, "count": i64::MAX})).await;
        assert_eq!(envelope.error_code(), Some("E_INVALID_PARAMS"));
        assert_eq!(session.count("variables"), 0);
    }

    fn nested_locals(session: MockSession) -> MockSession {
        session.on("variables", |args| match args["variablesReference"].as_i64() {
            Some(9) => Ok(json!({"variables": [
                {"name": "user", "value": "User", "variablesReference": 20},
                {"name": "count", "value": "3", "variablesReference": 0},
            ]})),
            Some(20) => Ok(json!({"variables": [{"name": "name", "value": "\"ada\"", "variablesReference": 0}]})),
            _ => Err(DapError::request("variables", "Invalid variable reference")),
        })
    }

    #[tokio::test]
    async fn test_list_variables_expands_top_frame() {
        let session = Arc::new(nested_locals(paused_session("node")));
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), Arc::new(CaptureStore::new()));

        let envelope = run(&ctx, "debug.list-variables", json!({"maxDepth": 2})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["metadata"]["frameId"], json!(100));
        assert_eq!(data["metadata"]["variableCount"], json!(1));
        assert_eq!(data["metadata"]["budget"]["nodes"], json!(3));
        let locals = &data["variables"][0];
        assert_eq!(locals["name"], json!("Locals"));
        assert_eq!(locals["variables"][0]["children"][0]["name"], json!("name"));
        assert_eq!(locals["variables"][1]["name"], json!("count"));
    }

    #[tokio::test]
    async fn test_list_variables_rejects_deep_request() {
        let ctx = context("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "debug.list-variables", json!({"maxDepth": 11})).await;
        assert_eq!(envelope.error_code(), Some("E_INVALID_PARAMS"));
    }

    #[tokio::test]
    async fn test_list_variables_reports_budget_with_partial_data() {
        let session = Arc::new(paused_session("node").on("variables", |args| {
            let reference = args["variablesReference"].as_i64().unwrap_or(0);
            let count = args["count"].as_i64().unwrap_or(0).min(1_000);
            let children: Vec<Value> = (0..count)
                .map(|i| {
                    let child_ref = if reference == 9 { 1_000 + i } else { 0 };
                    json!({"name": format!("v{i}"), "value": "x", "variablesReference": child_ref})
                })
                .collect();
            Ok(json!({"variables": children}))
        }));
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), Arc::new(CaptureStore::new()));

        let envelope = run(&ctx, "debug.list-variables", json!({"maxChildren": 1000})).await;
        assert_eq!(envelope.error_code(), Some("E_MEMORY_BUDGET_EXCEEDED"));
        let details = envelope.error.and_then(|e| e.details).expect("details");
        assert_eq!(details["budget"]["exceeded"], json!("node-limit"));
        assert_eq!(details["budget"]["nodes"], json!(20_000));
        let partial = details["partialData"][0]["variables"].as_array().expect("partial variables");
        assert!(!partial.is_empty() && partial.len() < 200, "unexpected partial size: {}", partial.len());
    }

    #[tokio::test]
    async fn test_list_variables_large_values_are_large_data() {
        let session = Arc::new(paused_session("node").on("variables", |_| {
            Ok(json!({"variables": [
                {"name": "blob", "value": "x".repeat(3 * 1024 * 1024), "variablesReference": 0},
                {"name": "blob2", "value": "y".repeat(3 * 1024 * 1024), "variablesReference": 0},
            ]}))
        }));
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), Arc::new(CaptureStore::new()));

        let envelope = run(&ctx, "debug.list-variables", json!({})).await;
        assert_eq!(envelope.error_code(), Some("E_LARGE_DATA"));
        let details = envelope.error.and_then(|e| e.details).expect("details");
        assert_eq!(details["partialData"][0]["variables"][0]["name"], json!("blob"));
    }

    #[tokio::test]
    async fn test_set_variable_read_only() {
        let session = Arc::new(paused_session("node").on("setVariable", |args| {
            if args["name"] == json!("PI") {
                Err(DapError::request("setVariable", "Variable is read-only"))
            } else {
                Err(DapError::request("setVariable", "Type mismatch"))
            }
        }));
        let ctx = context("/work", Arc::new(StaticSessions::with(session)), Arc::new(CaptureStore::new()));

        let envelope = run(&ctx, "debug.set-variable", json!({"variablesReference": 9, "name": "PI", "value": "3"})).await;
        assert_eq!(envelope.error_code(), Some("E_READ_ONLY"));
        let envelope = run(&ctx, "debug.set-variable", json!({"variablesReference": 9, "name": "x", "value": "{"})).await;
        assert_eq!(envelope.error_code(), Some("E_MODIFICATION_FAILED"));
    }
}
