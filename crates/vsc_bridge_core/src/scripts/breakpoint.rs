use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::breakpoints::{sync_file, Breakpoint};
use crate::codes::ErrorCode;
use crate::context::ScriptContext;
use crate::envelope::ScriptOutput;
use crate::error::ScriptError;
use crate::registry::{parse_params, Field, ParamSchema, Script, ScriptKind};

/// Push the stored breakpoints for `path` to the active session, if any.
/// Failures are reported but never fail the script.
async fn push_file(ctx: &ScriptContext, path: &str) {
    let Some(session) = ctx.bridge.sessions.active_session() else {
        return;
    };
    let breakpoints = ctx.bridge.breakpoints.for_file(path).await;
    if let Err(e) = sync_file(session.as_ref(), path, &breakpoints).await {
        tracing::warn!("Failed to sync breakpoints: path={}, session={}, error={}", path, session.id(), e);
        ctx.events
            .warn(format!("Breakpoints for {path} not applied to session {}: {e}", session.id()))
            .await;
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetParams {
    path: String,
    line: i64,
    condition: Option<String>,
    hit_condition: Option<String>,
    log_message: Option<String>,
}

pub struct SetBreakpoint;

#[async_trait]
impl Script for SetBreakpoint {
    fn name(&self) -> &'static str {
        "breakpoint.set"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Action
    }

    fn description(&self) -> &'static str {
        "Set a breakpoint, optionally conditional or a logpoint"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("path").required().describe("File path, absolute or workspace-relative"))
            .field(Field::integer("line").required().describe("1-based line number"))
            .field(Field::string("condition"))
            .field(Field::string("hitCondition"))
            .field(Field::string("logMessage"))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: SetParams = parse_params(params)?;
        let resolved = ctx.bridge.resolve_path(&params.path);
        let path = resolved.to_string_lossy().to_string();

        let contents = match tokio::fs::read_to_string(&resolved).await {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScriptError::new(ErrorCode::FileNotFound, format!("File not found: {path}"))
                    .with_details(json!({ "path": path })));
            }
            // Binary or unreadable files still take breakpoints.
            Err(_) => None,
        };
        if params.line < 1 {
            return Err(ScriptError::new(
                ErrorCode::InvalidLine,
                format!(
                    "Line number must be a positive integer (1 or greater), got {}",
                    params.line
                ),
            )
            .with_details(json!({ "line": params.line })));
        }
        if let Some(total) = contents.map(|c| c.lines().count()) {
            if params.line as usize > total {
                tracing::warn!("Breakpoint past end of file: path={}, line={}, lines={}", path, params.line, total);
                ctx.events
                    .warn(format!("Line {} is past the end of {path} ({total} lines)", params.line))
                    .await;
            }
        }

        let mut breakpoint = Breakpoint::new(path.clone(), params.line);
        breakpoint.condition = params.condition;
        breakpoint.hit_condition = params.hit_condition;
        breakpoint.log_message = params.log_message;
        ctx.bridge.breakpoints.set(breakpoint.clone()).await;
        push_file(&ctx, &path).await;

        ScriptOutput::data(json!({ "breakpoint": breakpoint }))
    }
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    path: String,
    line: i64,
}

pub struct RemoveBreakpoint;

#[async_trait]
impl Script for RemoveBreakpoint {
    fn name(&self) -> &'static str {
        "breakpoint.remove"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Action
    }

    fn description(&self) -> &'static str {
        "Remove the breakpoint at a file and line"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new()
            .field(Field::string("path").required())
            .field(Field::integer("line").required().min(1.0))
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: RemoveParams = parse_params(params)?;
        let path = ctx.bridge.resolve_path(&params.path).to_string_lossy().to_string();

        if ctx.bridge.breakpoints.remove(&path, params.line).await.is_none() {
            return Err(ScriptError::new(
                ErrorCode::NotFound,
                format!("No breakpoint at {path}:{}", params.line),
            )
            .with_details(json!({ "path": path, "line": params.line })));
        }
        push_file(&ctx, &path).await;
        ScriptOutput::data(json!({ "path": path, "line": params.line, "removed": true }))
    }
}

pub struct ListBreakpoints;

#[async_trait]
impl Script for ListBreakpoints {
    fn name(&self) -> &'static str {
        "breakpoint.list"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "List all breakpoints"
    }

    async fn run(&self, ctx: ScriptContext, _params: Value) -> Result<ScriptOutput, ScriptError> {
        let breakpoints = ctx.bridge.breakpoints.list().await;
        let total = breakpoints.len();
        ScriptOutput::data(json!({ "breakpoints": breakpoints, "total": total }))
    }
}

#[derive(Debug, Deserialize)]
struct ClearFileParams {
    path: String,
}

pub struct ClearFile;

#[async_trait]
impl Script for ClearFile {
    fn name(&self) -> &'static str {
        "breakpoint.clear.file"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Action
    }

    fn description(&self) -> &'static str {
        "Remove every breakpoint in one file"
    }

    fn params(&self) -> ParamSchema {
        ParamSchema::new().field(Field::string("path").required())
    }

    async fn run(&self, ctx: ScriptContext, params: Value) -> Result<ScriptOutput, ScriptError> {
        let params: ClearFileParams = parse_params(params)?;
        let path = ctx.bridge.resolve_path(&params.path).to_string_lossy().to_string();
        let cleared = ctx.bridge.breakpoints.clear_file(&path).await;
        if cleared > 0 {
            push_file(&ctx, &path).await;
        }
        ScriptOutput::data(json!({ "cleared": cleared, "path": path }))
    }
}

pub struct ClearProject;

#[async_trait]
impl Script for ClearProject {
    fn name(&self) -> &'static str {
        "breakpoint.clear-project"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Action
    }

    fn description(&self) -> &'static str {
        "Remove every breakpoint in the workspace"
    }

    async fn run(&self, ctx: ScriptContext, _params: Value) -> Result<ScriptOutput, ScriptError> {
        let files = ctx.bridge.breakpoints.files().await;
        let cleared = ctx.bridge.breakpoints.clear().await;
        for path in &files {
            push_file(&ctx, path).await;
        }
        ScriptOutput::data(json!({ "cleared": cleared }))
    }
}
