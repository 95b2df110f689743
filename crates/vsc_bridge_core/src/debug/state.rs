//! Pause detection: deciding whether a session is paused and which thread
//! carries the meaningful source location.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::capture::CaptureStore;
use crate::codes::ErrorCode;
use crate::debug::adapter::{DebugSession, Scope, SessionProvider, StackFrame, Thread};
use crate::error::{DapError, ScriptError};

/// Stack depth used for status snapshots.
pub const SNAPSHOT_LEVELS: i64 = 50;

const DEGRADED_PAUSE: &str =
    "No thread has a frame with resolvable source; reporting the first thread";

/// How a top frame is judged to carry a real source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDetector {
    /// Any resolvable source.
    Standard,
    /// Resolvable source and a positive line. Rejects the `[External Code]`
    /// placeholders some runtimes report for every non-stopped thread.
    Strict,
}

impl PauseDetector {
    pub fn for_session_type(session_type: &str) -> Self {
        match session_type {
            "coreclr" => PauseDetector::Strict,
            _ => PauseDetector::Standard,
        }
    }

    pub fn qualifies(&self, frame: &StackFrame) -> bool {
        let has_source = frame.source.as_ref().is_some_and(|s| s.is_resolvable());
        match self {
            PauseDetector::Standard => has_source,
            PauseDetector::Strict => has_source && frame.line > 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PausedThread {
    pub thread: Thread,
    pub frames: Vec<StackFrame>,
    pub total_frames: Option<i64>,
    /// False when no thread qualified and the first thread stands in.
    pub qualified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PauseProbe {
    Running,
    Paused(PausedThread),
}

/// Scan threads in adapter order and pick the first whose top frame
/// qualifies. A failing `threads` request means the session is running;
/// per-thread stack failures are skipped.
pub async fn resolve_pause(session: &dyn DebugSession, levels: i64) -> Result<PauseProbe, DapError> {
    let threads = match session.threads().await {
        Ok(threads) => threads,
        Err(DapError::Request { message, .. }) => {
            tracing::debug!("threads failed, treating as running: session={}, error={}", session.id(), message);
            return Ok(PauseProbe::Running);
        }
        Err(e) => return Err(e),
    };
    let Some(first) = threads.first().cloned() else {
        return Ok(PauseProbe::Running);
    };

    let detector = PauseDetector::for_session_type(session.session_type());
    let mut first_trace = None;
    for thread in threads {
        let trace = match session.stack_trace(thread.id, levels).await {
            Ok(trace) => trace,
            Err(e) => {
                tracing::debug!("stackTrace skipped: thread={}, error={}", thread.id, e);
                continue;
            }
        };
        if trace.stack_frames.first().is_some_and(|f| detector.qualifies(f)) {
            return Ok(PauseProbe::Paused(PausedThread {
                thread,
                frames: trace.stack_frames,
                total_frames: trace.total_frames,
                qualified: true,
            }));
        }
        if thread.id == first.id {
            first_trace = Some(trace);
        }
    }

    let trace = first_trace.unwrap_or_default();
    Ok(PauseProbe::Paused(PausedThread {
        thread: first,
        frames: trace.stack_frames,
        total_frames: trace.total_frames,
        qualified: false,
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub file: Option<String>,
    pub line: i64,
    pub column: i64,
    pub function_name: String,
}

impl Location {
    pub fn from_frame(frame: &StackFrame) -> Self {
        Self {
            file: frame.file().map(str::to_string),
            line: frame.line,
            column: frame.column,
            function_name: frame.name.clone(),
        }
    }
}

/// Debug state derived fresh on every query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSnapshot {
    pub is_active: bool,
    pub is_paused: bool,
    pub session_id: Option<String>,
    pub session_type: Option<String>,
    pub session_name: Option<String>,
    pub current_thread: Option<Thread>,
    pub stack_frames: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<i64>,
    pub current_location: Option<Location>,
    pub scopes: Vec<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DebugSnapshot {
    fn inactive() -> Self {
        Self {
            is_active: false,
            is_paused: false,
            session_id: None,
            session_type: None,
            session_name: None,
            current_thread: None,
            stack_frames: Vec::new(),
            total_frames: None,
            current_location: None,
            scopes: Vec::new(),
            error: None,
        }
    }
}

pub async fn snapshot(sessions: &dyn SessionProvider, include_scopes: bool) -> Result<DebugSnapshot, DapError> {
    let Some(session) = sessions.active_session() else {
        return Ok(DebugSnapshot::inactive());
    };
    let mut snapshot = DebugSnapshot {
        is_active: true,
        session_id: Some(session.id().to_string()),
        session_type: Some(session.session_type().to_string()),
        session_name: Some(session.name().to_string()),
        ..DebugSnapshot::inactive()
    };

    let PauseProbe::Paused(paused) = resolve_pause(session.as_ref(), SNAPSHOT_LEVELS).await? else {
        return Ok(snapshot);
    };
    snapshot.is_paused = true;
    snapshot.current_location = paused.frames.first().map(Location::from_frame);
    if !paused.qualified {
        snapshot.error = Some(DEGRADED_PAUSE.to_string());
    }
    if include_scopes {
        if let Some(frame) = paused.frames.first() {
            match session.scopes(frame.id).await {
                Ok(scopes) => snapshot.scopes = scopes,
                Err(e) => tracing::debug!("scopes skipped: frame={}, error={}", frame.id, e),
            }
        }
    }
    snapshot.current_thread = Some(paused.thread);
    snapshot.stack_frames = paused.frames;
    snapshot.total_frames = paused.total_frames;
    Ok(snapshot)
}

#[derive(Debug, Clone, PartialEq)]
struct CachedThread {
    session_id: String,
    thread_id: i64,
    generation: usize,
}

/// Last thread confirmed paused, per the most recent session.
///
/// `generation` is the session's stop count when the observation started, so
/// a slow response from an older pause can never overwrite a newer entry.
#[derive(Debug, Default)]
pub struct ThreadCache {
    entry: Mutex<Option<CachedThread>>,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<i64> {
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.session_id == session_id)
            .map(|c| c.thread_id)
    }

    pub fn remember(&self, session_id: &str, thread_id: i64, generation: usize) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = entry
            .as_ref()
            .is_some_and(|c| c.session_id == session_id && c.generation > generation);
        if stale {
            tracing::debug!("Ignoring stale thread observation: thread={}, generation={}", thread_id, generation);
            return;
        }
        *entry = Some(CachedThread {
            session_id: session_id.to_string(),
            thread_id,
            generation,
        });
    }

    pub fn invalidate(&self, session_id: &str) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        if entry.as_ref().is_some_and(|c| c.session_id == session_id) {
            *entry = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadOrigin {
    LastStop,
    Cache,
    Scan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedThread {
    pub thread_id: i64,
    pub top_frame: Option<StackFrame>,
    pub origin: ThreadOrigin,
    pub qualified: bool,
}

/// The paused thread to act on. Candidates from the latest captured stop and
/// the cache are validated with one `stackTrace` each before falling back to
/// a full scan.
pub async fn resolve_active_thread(
    session: &dyn DebugSession,
    capture: &CaptureStore,
    cache: &ThreadCache,
) -> Result<ResolvedThread, ScriptError> {
    let session_id = session.id();
    let generation = capture.stop_count(session_id).await;
    let detector = PauseDetector::for_session_type(session.session_type());

    let mut candidates = Vec::new();
    if let Some((thread_id, _)) = capture.last_stop(session_id).await {
        candidates.push((thread_id, ThreadOrigin::LastStop));
    }
    if let Some(thread_id) = cache.get(session_id) {
        if !candidates.iter().any(|(id, _)| *id == thread_id) {
            candidates.push((thread_id, ThreadOrigin::Cache));
        }
    }

    for (thread_id, origin) in candidates {
        match session.stack_trace(thread_id, 1).await {
            Ok(trace) if trace.stack_frames.first().is_some_and(|f| detector.qualifies(f)) => {
                cache.remember(session_id, thread_id, generation);
                return Ok(ResolvedThread {
                    thread_id,
                    top_frame: trace.stack_frames.into_iter().next(),
                    origin,
                    qualified: true,
                });
            }
            Ok(_) => tracing::debug!("Candidate thread has no source frame: thread={}", thread_id),
            Err(e) => tracing::debug!("Candidate thread not paused: thread={}, error={}", thread_id, e),
        }
    }
    cache.invalidate(session_id);

    match resolve_pause(session, 1).await? {
        PauseProbe::Paused(paused) => {
            if paused.qualified {
                cache.remember(session_id, paused.thread.id, generation);
            }
            Ok(ResolvedThread {
                thread_id: paused.thread.id,
                top_frame: paused.frames.into_iter().next(),
                origin: ThreadOrigin::Scan,
                qualified: paused.qualified,
            })
        }
        PauseProbe::Running => Err(ScriptError::new(
            ErrorCode::NotStopped,
            "Debugger is not paused",
        )),
    }
}
