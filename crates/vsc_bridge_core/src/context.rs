//! State shared by every script invocation, constructed once by the host and
//! passed down explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::breakpoints::BreakpointStore;
use crate::capture::CaptureStore;
use crate::codes::ErrorCode;
use crate::debug::{DebugSession, SessionProvider, ThreadCache};
use crate::error::ScriptError;
use crate::registry::Registry;
use crate::transport::ids::host_job_id;
use crate::transport::JobEvents;

pub struct BridgeContext {
    pub workspace: PathBuf,
    pub capture: Arc<CaptureStore>,
    pub threads: ThreadCache,
    pub breakpoints: BreakpointStore,
    pub sessions: Arc<dyn SessionProvider>,
}

impl BridgeContext {
    pub fn new(
        workspace: impl Into<PathBuf>,
        sessions: Arc<dyn SessionProvider>,
        capture: Arc<CaptureStore>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            capture,
            threads: ThreadCache::new(),
            breakpoints: BreakpointStore::new(),
            sessions,
        }
    }

    /// Relative paths are taken from the workspace root.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// The requested session, or the active one.
    pub fn session(&self, session_id: Option<&str>) -> Result<Arc<dyn DebugSession>, ScriptError> {
        self.sessions.resolve(session_id).ok_or_else(|| match session_id {
            Some(id) => ScriptError::new(
                ErrorCode::NoDebugSession,
                format!("Debug session \"{id}\" is not active"),
            ),
            None => ScriptError::from_code(ErrorCode::NoDebugSession),
        })
    }
}

/// Per-invocation view handed to a script.
#[derive(Clone)]
pub struct ScriptContext {
    pub bridge: Arc<BridgeContext>,
    pub registry: Arc<Registry>,
    pub request_id: String,
    pub cancel: CancellationToken,
    pub events: JobEvents,
}

impl ScriptContext {
    /// A context outside any job, with a host-originated id and no event stream.
    pub fn detached(bridge: Arc<BridgeContext>, registry: Arc<Registry>) -> Self {
        Self {
            bridge,
            registry,
            request_id: host_job_id(),
            cancel: CancellationToken::new(),
            events: JobEvents::disabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::NoSessions;

    #[test]
    fn test_resolve_path_against_workspace() {
        let ctx = BridgeContext::new("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        assert_eq!(ctx.resolve_path("src/a.js"), PathBuf::from("/work/src/a.js"));
        assert_eq!(ctx.resolve_path("/tmp/x.js"), PathBuf::from("/tmp/x.js"));
    }

    #[test]
    fn test_missing_session_error() {
        let ctx = BridgeContext::new("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let err = ctx.session(None).err().expect("no session");
        assert_eq!(err.code, ErrorCode::NoDebugSession);
        let err = ctx.session(Some("abc")).err().expect("no session");
        assert!(err.message.contains("abc"), "unexpected message: {}", err.message);
    }
}
