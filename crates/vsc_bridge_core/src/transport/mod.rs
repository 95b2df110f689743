//! Filesystem request/response transport.
//!
//! A client drops `execute/<id>/command.json`, the host claims it with
//! `claimed.json`, answers with `response.json` and finally touches `done`.
//! Either side may write `cancel`. The client always removes the job directory
//! once it has an outcome.

pub mod client;
pub mod events;
pub mod host;
pub mod ids;
pub mod io;
pub mod layout;
pub mod maintenance;

pub use client::{check_health, find_bridge_root, BridgeClient, BridgeHealth, JobInspector};
pub use events::JobEvents;
pub use host::{BridgeHost, CommandExecutor, JobProcessor};
pub use layout::{CommandFile, HostInfo, JobDir};
