use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::codes::ErrorCode;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge unavailable: {0}")]
    Unavailable(String),

    #[error("Command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Command was not picked up within {}ms", .0.as_millis())]
    PickupTimeout(Duration),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Command completed without response")]
    NoResponse,

    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Bridge directory is owned by another host (pid {0})")]
    HostLocked(u32),

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Unavailable(_) | BridgeError::HostLocked(_) => {
                ErrorCode::BridgeUnavailable
            }
            BridgeError::Timeout(_) => ErrorCode::Timeout,
            BridgeError::PickupTimeout(_) => ErrorCode::PickupTimeout,
            BridgeError::Cancelled => ErrorCode::Cancelled,
            BridgeError::NoResponse => ErrorCode::NoResponse,
            BridgeError::InvalidJobId(_) => ErrorCode::InvalidParams,
            BridgeError::Deserialize(_) | BridgeError::Io(_) | BridgeError::InvalidResponse(_) => {
                ErrorCode::Internal
            }
        }
    }
}

/// Failure of a single debug adapter round trip.
#[derive(Error, Debug, Clone)]
pub enum DapError {
    /// The adapter answered with `success: false`.
    #[error("DAP request '{command}' failed: {message}")]
    Request { command: String, message: String },

    #[error("Timed out waiting for DAP response to '{command}'")]
    Timeout { command: String },

    #[error("Debug adapter connection closed")]
    Closed,

    #[error("Debug adapter transport error: {0}")]
    Transport(String),
}

impl DapError {
    pub fn request(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Errors that mean the session is gone rather than merely not paused.
    pub fn is_session_ended(&self) -> bool {
        match self {
            DapError::Closed => true,
            DapError::Request { message, .. } => {
                message.contains("Session")
                    || message.contains("terminated")
                    || message.contains("No debugger available")
                    || message.contains("not stopped")
            }
            DapError::Timeout { .. } | DapError::Transport(_) => false,
        }
    }
}

/// A coded, user-visible failure returned by a script handler.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct ScriptError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
    pub hint: Option<String>,
}

impl ScriptError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            hint: code.hint().map(str::to_string),
        }
    }

    /// Failure using the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<DapError> for ScriptError {
    fn from(err: DapError) -> Self {
        let code = match &err {
            DapError::Closed => ErrorCode::SessionTerminated,
            DapError::Timeout { .. } => ErrorCode::Timeout,
            DapError::Request { .. } if err.is_session_ended() => ErrorCode::SessionTerminated,
            DapError::Request { .. } | DapError::Transport(_) => ErrorCode::Internal,
        };
        ScriptError::new(code, err.to_string())
    }
}

impl From<BridgeError> for ScriptError {
    fn from(err: BridgeError) -> Self {
        ScriptError::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display_messages() {
        let timeout = BridgeError::Timeout(Duration::from_millis(1500));
        assert_eq!(timeout.to_string(), "Command timed out after 1500ms");

        let dap = DapError::request("threads", "not stopped");
        assert_eq!(dap.to_string(), "DAP request 'threads' failed: not stopped");

        let script = ScriptError::new(ErrorCode::InvalidLine, "bad line");
        assert_eq!(script.to_string(), "[E_INVALID_LINE] bad line");
    }

    #[test]
    fn test_bridge_error_codes() {
        assert_eq!(BridgeError::Cancelled.code(), ErrorCode::Cancelled);
        assert_eq!(
            BridgeError::PickupTimeout(Duration::from_secs(5)).code(),
            ErrorCode::PickupTimeout
        );
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let bridge_err: BridgeError = io_err.into();
        assert!(matches!(bridge_err, BridgeError::Io(_)));
        assert_eq!(bridge_err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_session_ended_detection() {
        assert!(DapError::Closed.is_session_ended());
        assert!(DapError::request("stackTrace", "Session is terminated").is_session_ended());
        assert!(DapError::request("threads", "No debugger available").is_session_ended());
        assert!(!DapError::request("stackTrace", "Invalid thread id").is_session_ended());
        assert!(!DapError::Timeout {
            command: "threads".into()
        }
        .is_session_ended());
    }

    #[test]
    fn test_script_error_builders() {
        let err = ScriptError::from_code(ErrorCode::NotStopped)
            .with_details(json!({"threadId": 3}));
        assert_eq!(err.message, ErrorCode::NotStopped.default_message());
        assert_eq!(err.hint.as_deref(), ErrorCode::NotStopped.hint());
        assert_eq!(err.details, Some(json!({"threadId": 3})));

        let mapped: ScriptError = DapError::Closed.into();
        assert_eq!(mapped.code, ErrorCode::SessionTerminated);
    }
}
