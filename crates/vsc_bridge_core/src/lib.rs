//! VSC Bridge Core
//!
//! Filesystem IPC between command-line or MCP clients and a long-lived host
//! that drives a debug adapter. Provides the response envelope, the job
//! transport, the script registry, the debug session state machine and the
//! passive event capture that analysis scripts read from.

pub mod breakpoints;
pub mod capture;
pub mod codes;
pub mod config;
pub mod context;
pub mod debug;
pub mod envelope;
pub mod error;
pub mod format;
pub mod registry;
pub mod scripts;
pub mod transport;

#[cfg(test)]
mod scenarios;

// Re-export commonly used types
pub use capture::CaptureStore;
pub use codes::ErrorCode;
pub use config::{BridgeConfig, HostConfig};
pub use context::{BridgeContext, ScriptContext};
pub use envelope::{Envelope, ScriptOutput};
pub use error::{BridgeError, DapError, ScriptError};
pub use registry::{Dispatcher, Registry, Script, ScriptKind};
pub use transport::{BridgeClient, BridgeHost};

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
