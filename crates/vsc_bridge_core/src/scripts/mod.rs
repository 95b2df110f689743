//! Built-in scripts registered by every host.

pub mod breakpoint;
pub mod dap;
pub mod debug;
pub mod meta;

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde_json::json;

use crate::capture::{CaptureStore, CapturedSession};
use crate::codes::ErrorCode;
use crate::error::ScriptError;
use crate::registry::Script;

pub fn builtin() -> Vec<Arc<dyn Script>> {
    vec![
        Arc::new(breakpoint::SetBreakpoint),
        Arc::new(breakpoint::RemoveBreakpoint),
        Arc::new(breakpoint::ListBreakpoints),
        Arc::new(breakpoint::ClearFile),
        Arc::new(breakpoint::ClearProject),
        Arc::new(debug::Status),
        Arc::new(debug::WaitForHit),
        Arc::new(debug::Step::CONTINUE),
        Arc::new(debug::Step::OVER),
        Arc::new(debug::Step::INTO),
        Arc::new(debug::Step::OUT),
        Arc::new(debug::Threads),
        Arc::new(debug::Stack),
        Arc::new(debug::Scopes),
        Arc::new(debug::Evaluate),
        Arc::new(debug::GetVariable),
        Arc::new(debug::ListVariables),
        Arc::new(debug::SetVariable),
        Arc::new(dap::Summary),
        Arc::new(dap::Logs),
        Arc::new(dap::Search),
        Arc::new(dap::Filter),
        Arc::new(dap::Exceptions),
        Arc::new(dap::Stats),
        Arc::new(dap::Timeline),
        Arc::new(dap::Compare),
        Arc::new(meta::ListScripts),
    ]
}

/// One captured session: `session_id`, or the latest.
pub(crate) async fn captured(
    capture: &CaptureStore,
    session_id: Option<&str>,
) -> Result<CapturedSession, ScriptError> {
    if let Some(session) = capture.session(session_id).await {
        return Ok(session);
    }
    Err(match session_id {
        Some(id) => ScriptError::new(
            ErrorCode::NotFound,
            format!("Session \"{id}\" not found - may have been cleared or never existed"),
        )
        .with_details(json!({ "sessionId": id })),
        None => ScriptError::new(ErrorCode::NoSession, "No debug sessions captured yet"),
    })
}

/// Like [`captured`], but `"all"` selects every session, newest first.
pub(crate) async fn captured_many(
    capture: &CaptureStore,
    session_id: Option<&str>,
) -> Result<Vec<CapturedSession>, ScriptError> {
    if session_id != Some("all") {
        return captured(capture, session_id).await.map(|s| vec![s]);
    }
    let sessions = capture.sessions().await;
    if sessions.is_empty() {
        return Err(ScriptError::new(ErrorCode::NoSession, "No debug sessions captured yet"));
    }
    Ok(sessions)
}

pub(crate) fn compile_pattern(
    field: &str,
    pattern: &str,
    case_sensitive: bool,
) -> Result<Regex, ScriptError> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| {
            ScriptError::new(ErrorCode::InvalidParams, format!("Invalid regex pattern: {e}"))
                .with_details(json!({ "errors": [{ "path": field, "message": e.to_string(), "code": "invalid_string" }] }))
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use serde_json::Value;

    use crate::capture::CaptureStore;
    use crate::context::{BridgeContext, ScriptContext};
    use crate::debug::SessionProvider;
    use crate::envelope::{normalize_result, Envelope, Meta};
    use crate::registry::Registry;

    pub fn context(workspace: &str, sessions: Arc<dyn SessionProvider>, capture: Arc<CaptureStore>) -> ScriptContext {
        let bridge = BridgeContext::new(workspace, sessions, capture);
        ScriptContext::detached(Arc::new(bridge), Arc::new(Registry::with_builtin_scripts()))
    }

    /// Validate, run, and normalize the way the dispatcher would.
    pub async fn run(ctx: &ScriptContext, name: &str, params: Value) -> Envelope {
        let result = ctx
            .registry
            .dispatch(
                Arc::clone(&ctx.bridge),
                &ctx.request_id,
                name,
                params,
                ctx.cancel.clone(),
                ctx.events.clone(),
            )
            .await;
        normalize_result(result, Meta::new(&ctx.request_id, Some(name), 0))
    }
}
