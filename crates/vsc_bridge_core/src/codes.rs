use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Machine-readable error codes carried in `error.code` of every failure envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Script layer
    ScriptNotFound,
    ScriptFailed,
    InvalidParams,
    MissingRequiredParam,
    FileNotFound,
    InvalidLine,
    InvalidPath,
    NotFound,

    // Transport
    Timeout,
    Cancelled,
    Capacity,
    CircuitOpen,
    PickupTimeout,
    BridgeUnavailable,
    NoResponse,
    CrashRecovery,

    // Debugger
    NoSession,
    NoDebugSession,
    NotPaused,
    NotStopped,
    NoThreads,
    NoStack,
    SessionTerminated,
    EvaluateFailed,
    InvalidReference,
    ModificationFailed,
    ReadOnly,
    UnsupportedOperation,
    UnsupportedLanguage,
    LargeData,
    MemoryBudgetExceeded,

    Internal,
    Unknown,
}

const ALL: &[ErrorCode] = &[
    ErrorCode::ScriptNotFound,
    ErrorCode::ScriptFailed,
    ErrorCode::InvalidParams,
    ErrorCode::MissingRequiredParam,
    ErrorCode::FileNotFound,
    ErrorCode::InvalidLine,
    ErrorCode::InvalidPath,
    ErrorCode::NotFound,
    ErrorCode::Timeout,
    ErrorCode::Cancelled,
    ErrorCode::Capacity,
    ErrorCode::CircuitOpen,
    ErrorCode::PickupTimeout,
    ErrorCode::BridgeUnavailable,
    ErrorCode::NoResponse,
    ErrorCode::CrashRecovery,
    ErrorCode::NoSession,
    ErrorCode::NoDebugSession,
    ErrorCode::NotPaused,
    ErrorCode::NotStopped,
    ErrorCode::NoThreads,
    ErrorCode::NoStack,
    ErrorCode::SessionTerminated,
    ErrorCode::EvaluateFailed,
    ErrorCode::InvalidReference,
    ErrorCode::ModificationFailed,
    ErrorCode::ReadOnly,
    ErrorCode::UnsupportedOperation,
    ErrorCode::UnsupportedLanguage,
    ErrorCode::LargeData,
    ErrorCode::MemoryBudgetExceeded,
    ErrorCode::Internal,
    ErrorCode::Unknown,
];

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ScriptNotFound => "E_SCRIPT_NOT_FOUND",
            ErrorCode::ScriptFailed => "E_SCRIPT_FAILED",
            ErrorCode::InvalidParams => "E_INVALID_PARAMS",
            ErrorCode::MissingRequiredParam => "E_MISSING_REQUIRED_PARAM",
            ErrorCode::FileNotFound => "E_FILE_NOT_FOUND",
            ErrorCode::InvalidLine => "E_INVALID_LINE",
            ErrorCode::InvalidPath => "E_INVALID_PATH",
            ErrorCode::NotFound => "E_NOT_FOUND",
            ErrorCode::Timeout => "E_TIMEOUT",
            ErrorCode::Cancelled => "E_CANCELLED",
            ErrorCode::Capacity => "E_CAPACITY",
            ErrorCode::CircuitOpen => "E_CIRCUIT_OPEN",
            ErrorCode::PickupTimeout => "E_PICKUP_TIMEOUT",
            ErrorCode::BridgeUnavailable => "E_BRIDGE_UNAVAILABLE",
            ErrorCode::NoResponse => "E_NO_RESPONSE",
            ErrorCode::CrashRecovery => "E_CRASH_RECOVERY",
            ErrorCode::NoSession => "E_NO_SESSION",
            ErrorCode::NoDebugSession => "E_NO_DEBUG_SESSION",
            ErrorCode::NotPaused => "E_NOT_PAUSED",
            ErrorCode::NotStopped => "E_NOT_STOPPED",
            ErrorCode::NoThreads => "E_NO_THREADS",
            ErrorCode::NoStack => "E_NO_STACK",
            ErrorCode::SessionTerminated => "E_SESSION_TERMINATED",
            ErrorCode::EvaluateFailed => "E_EVALUATE_FAILED",
            ErrorCode::InvalidReference => "E_INVALID_REFERENCE",
            ErrorCode::ModificationFailed => "E_MODIFICATION_FAILED",
            ErrorCode::ReadOnly => "E_READ_ONLY",
            ErrorCode::UnsupportedOperation => "E_UNSUPPORTED_OPERATION",
            ErrorCode::UnsupportedLanguage => "E_UNSUPPORTED_LANGUAGE",
            ErrorCode::LargeData => "E_LARGE_DATA",
            ErrorCode::MemoryBudgetExceeded => "E_MEMORY_BUDGET_EXCEEDED",
            ErrorCode::Internal => "E_INTERNAL",
            ErrorCode::Unknown => "E_UNKNOWN",
        }
    }

    /// Message used when a failure carries no message of its own.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ScriptNotFound => "Script not found",
            ErrorCode::ScriptFailed => "Script execution failed",
            ErrorCode::InvalidParams => "Invalid parameters provided",
            ErrorCode::MissingRequiredParam => "Required parameter is missing",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::InvalidLine => "Invalid line number",
            ErrorCode::InvalidPath => "Invalid file path",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::Cancelled => "Operation cancelled by user",
            ErrorCode::Capacity => "Capacity limit reached",
            ErrorCode::CircuitOpen => "Too many failures, circuit breaker is open",
            ErrorCode::PickupTimeout => "Command was not picked up by the host",
            ErrorCode::BridgeUnavailable => "Bridge host is not running",
            ErrorCode::NoResponse => "Command completed without response",
            ErrorCode::CrashRecovery => "Job was in flight when the host stopped",
            ErrorCode::NoSession => "No active debug session",
            ErrorCode::NoDebugSession => "No active debug session",
            ErrorCode::NotPaused => "Debugger is not paused",
            ErrorCode::NotStopped => {
                "Operation requires the debuggee to be in a DAP \"stopped\" (paused) state"
            }
            ErrorCode::NoThreads => "No threads available in debug session",
            ErrorCode::NoStack => "No stack frames available",
            ErrorCode::SessionTerminated => "Debug session has terminated",
            ErrorCode::EvaluateFailed => "Expression evaluation failed",
            ErrorCode::InvalidReference => "Invalid variables reference",
            ErrorCode::ModificationFailed => "Failed to modify variable",
            ErrorCode::ReadOnly => "Variable is read-only",
            ErrorCode::UnsupportedOperation => "Operation not supported by this debug adapter",
            ErrorCode::UnsupportedLanguage => "Language not supported",
            ErrorCode::LargeData => "Result too large to transfer",
            ErrorCode::MemoryBudgetExceeded => "Memory budget exceeded",
            ErrorCode::Internal => "Internal server error",
            ErrorCode::Unknown => "Unknown error",
        }
    }

    /// Recovery hint for codes where the fix is something the caller can do.
    pub fn hint(&self) -> Option<&'static str> {
        let hint = match self {
            ErrorCode::NoSession | ErrorCode::NoDebugSession => {
                "Start a debug session first (debug.start) and retry"
            }
            ErrorCode::NotPaused => {
                "Set a breakpoint and wait for execution to stop, or use the pause button in the debug toolbar"
            }
            ErrorCode::NotStopped => {
                "Pause at a breakpoint (DAP stopped state) before retrying this operation"
            }
            ErrorCode::NoThreads => "Wait for the debuggee to start threads and pause",
            ErrorCode::NoStack => "Ensure the debugger is paused at a location with source",
            ErrorCode::SessionTerminated => "Start a new debug session to continue debugging",
            ErrorCode::ModificationFailed => {
                "Check that the new value is valid for the variable's type"
            }
            ErrorCode::ReadOnly => "This variable cannot be modified in the current context",
            ErrorCode::UnsupportedOperation => {
                "This debug adapter does not support the requested capability"
            }
            ErrorCode::LargeData | ErrorCode::MemoryBudgetExceeded => {
                "Lower maxDepth or maxChildren, or page through children with debug.get-variable"
            }
            ErrorCode::BridgeUnavailable => "Start the bridge host in this workspace",
            ErrorCode::CircuitOpen => "Wait for details.retryAfter seconds before retrying",
            _ => return None,
        };
        Some(hint)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| format!("unknown error code: {s}"))
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_strings() {
        for code in ALL {
            let parsed: ErrorCode = code.as_str().parse().expect("code should parse");
            assert_eq!(parsed, *code);
        }
        assert!("E_NOPE".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let value = serde_json::to_value(ErrorCode::InvalidLine).expect("serialize");
        assert_eq!(value, serde_json::json!("E_INVALID_LINE"));
    }

    #[test]
    fn test_debug_codes_carry_hints() {
        assert_eq!(
            ErrorCode::NotStopped.hint(),
            Some("Pause at a breakpoint (DAP stopped state) before retrying this operation")
        );
        assert!(ErrorCode::SessionTerminated.hint().is_some());
        assert!(ErrorCode::InvalidLine.hint().is_none());
    }
}
