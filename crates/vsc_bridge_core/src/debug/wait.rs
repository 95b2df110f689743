//! Waiting for the debugger to reach an outcome: a pause with source, the
//! session ending, or an unrecoverable adapter failure.

use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::capture::CaptureStore;
use crate::codes::ErrorCode;
use crate::debug::adapter::{DebugSession, SessionProvider};
use crate::debug::state::{resolve_active_thread, resolve_pause, PauseProbe, ThreadCache};
use crate::error::{DapError, ScriptError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consecutive transport failures tolerated before giving up.
const MAX_TRANSPORT_ERRORS: u32 = 5;

const ADAPTER_FAILURE_HINT: &str = "The debug adapter stopped responding; restart the debug session";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DebugOutcome {
    #[serde(rename_all = "camelCase")]
    Stopped {
        file: Option<String>,
        line: i64,
        column: i64,
        function_name: String,
        thread_id: i64,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Terminated {
        session_id: Option<String>,
        exit_code: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        session_id: Option<String>,
        code: ErrorCode,
        message: String,
        hint: Option<String>,
    },
}

impl DebugOutcome {
    /// Stopped and terminated are results; an error outcome becomes a failure.
    pub fn into_result(self) -> Result<Self, ScriptError> {
        match self {
            DebugOutcome::Error {
                session_id,
                code,
                message,
                hint,
            } => {
                let mut err = ScriptError::new(code, message);
                if let Some(hint) = hint {
                    err = err.with_hint(hint);
                }
                if let Some(session_id) = session_id {
                    err = err.with_details(serde_json::json!({ "sessionId": session_id }));
                }
                Err(err)
            }
            outcome => Ok(outcome),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum WaitState {
    AwaitingSession,
    Tracking { session_id: String },
}

fn timed_out(timeout: Duration, what: &str) -> ScriptError {
    ScriptError::new(
        ErrorCode::Timeout,
        format!("Timed out after {}ms waiting for {what}", timeout.as_millis()),
    )
    .with_hint(ErrorCode::NotStopped.hint().unwrap_or_default())
}

fn cancelled() -> ScriptError {
    ScriptError::from_code(ErrorCode::Cancelled)
}

/// Sleep one poll interval without overshooting the deadline.
/// Returns false once the deadline has passed.
async fn pause(deadline: Instant, poll: Duration, cancel: &CancellationToken) -> Result<bool, ScriptError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Ok(false);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled()),
        _ = sleep(poll.min(remaining)) => Ok(true),
    }
}

async fn exit_code(capture: &CaptureStore, session_id: &str) -> Option<i64> {
    capture.session(Some(session_id)).await.and_then(|s| s.exit_code)
}

/// Poll until some session pauses at a frame with source, or the tracked
/// session goes away. `session_id` pins the wait to one session; otherwise
/// the active session is re-read on every poll since adapters may replace it
/// during launch.
pub async fn wait_until_paused(
    sessions: &dyn SessionProvider,
    capture: &CaptureStore,
    session_id: Option<&str>,
    options: WaitOptions,
    cancel: &CancellationToken,
) -> Result<DebugOutcome, ScriptError> {
    let deadline = Instant::now() + options.timeout;
    let mut state = match session_id {
        Some(id) => WaitState::Tracking {
            session_id: id.to_string(),
        },
        None => WaitState::AwaitingSession,
    };
    let mut transport_errors = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        match sessions.resolve(session_id) {
            None => {
                if let WaitState::Tracking { session_id } = &state {
                    tracing::debug!("Session vanished while waiting: session={}", session_id);
                    return Ok(DebugOutcome::Terminated {
                        session_id: Some(session_id.clone()),
                        exit_code: exit_code(capture, session_id).await,
                    });
                }
            }
            Some(session) => {
                let id = session.id().to_string();
                if state == WaitState::AwaitingSession {
                    tracing::debug!("Session appeared: session={}", id);
                }
                state = WaitState::Tracking {
                    session_id: id.clone(),
                };

                if capture.is_terminated(&id).await {
                    return Ok(DebugOutcome::Terminated {
                        exit_code: exit_code(capture, &id).await,
                        session_id: Some(id),
                    });
                }

                match resolve_pause(session.as_ref(), 1).await {
                    Ok(PauseProbe::Paused(paused)) if paused.qualified => {
                        let frame = paused.frames.first();
                        return Ok(DebugOutcome::Stopped {
                            file: frame.and_then(|f| f.file()).map(str::to_string),
                            line: frame.map_or(0, |f| f.line),
                            column: frame.map_or(0, |f| f.column),
                            function_name: frame.map(|f| f.name.clone()).unwrap_or_default(),
                            thread_id: paused.thread.id,
                            session_id: id,
                        });
                    }
                    Ok(_) => transport_errors = 0,
                    Err(e) if e.is_session_ended() => {
                        return Ok(DebugOutcome::Terminated {
                            exit_code: exit_code(capture, &id).await,
                            session_id: Some(id),
                        });
                    }
                    Err(DapError::Request { .. }) => transport_errors = 0,
                    Err(e) => {
                        transport_errors += 1;
                        tracing::debug!("Poll failed: session={}, attempt={}, error={}", id, transport_errors, e);
                        if transport_errors >= MAX_TRANSPORT_ERRORS {
                            let err = ScriptError::from(e);
                            return Ok(DebugOutcome::Error {
                                session_id: Some(id),
                                code: err.code,
                                message: err.message,
                                hint: Some(ADAPTER_FAILURE_HINT.to_string()),
                            });
                        }
                    }
                }
            }
        }

        if !pause(deadline, options.poll_interval, cancel).await? {
            return Err(timed_out(options.timeout, "debugger to pause"));
        }
    }
}

/// After a step or continue, wait for the next captured stop beyond
/// `baseline` (the stop count sampled before the command was sent).
pub async fn wait_for_next_stop(
    session: &dyn DebugSession,
    sessions: &dyn SessionProvider,
    capture: &CaptureStore,
    cache: &ThreadCache,
    baseline: usize,
    options: WaitOptions,
    cancel: &CancellationToken,
) -> Result<DebugOutcome, ScriptError> {
    let deadline = Instant::now() + options.timeout;
    let session_id = session.id().to_string();

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        if capture.is_terminated(&session_id).await || sessions.session(&session_id).is_none() {
            return Ok(DebugOutcome::Terminated {
                exit_code: exit_code(capture, &session_id).await,
                session_id: Some(session_id),
            });
        }

        let stops = capture.stop_count(&session_id).await;
        if stops > baseline {
            let thread_id = match capture.last_stop(&session_id).await {
                Some((thread_id, _)) => thread_id,
                None => resolve_active_thread(session, capture, cache).await?.thread_id,
            };
            return match session.stack_trace(thread_id, 1).await {
                Ok(trace) => match trace.stack_frames.into_iter().next() {
                    Some(frame) => {
                        cache.remember(&session_id, thread_id, stops);
                        Ok(DebugOutcome::Stopped {
                            file: frame.file().map(str::to_string),
                            line: frame.line,
                            column: frame.column,
                            function_name: frame.name,
                            thread_id,
                            session_id,
                        })
                    }
                    None => Ok(no_stack(session_id, thread_id, "stack trace was empty")),
                },
                Err(e) if e.is_session_ended() => Ok(DebugOutcome::Terminated {
                    exit_code: exit_code(capture, &session_id).await,
                    session_id: Some(session_id),
                }),
                Err(e) => Ok(no_stack(session_id, thread_id, &e.to_string())),
            };
        }

        if !pause(deadline, options.poll_interval, cancel).await? {
            return Err(timed_out(options.timeout, "the debugger to stop"));
        }
    }
}

fn no_stack(session_id: String, thread_id: i64, reason: &str) -> DebugOutcome {
    DebugOutcome::Error {
        session_id: Some(session_id),
        code: ErrorCode::NoStack,
        message: format!("Stopped on thread {thread_id} but could not read its stack: {reason}"),
        hint: None,
    }
}
