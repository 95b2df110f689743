//! Debug session state machine: `NoSession -> Running <-> Paused -> Terminated`,
//! derived by polling the adapter rather than stored.

pub mod adapter;
pub mod state;
pub mod variables;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{
    DebugSession, EvaluateResult, NoSessions, Scope, SessionProvider, Source, StackFrame,
    StackTrace, Thread, Variable,
};
pub use state::{
    resolve_active_thread, resolve_pause, snapshot, DebugSnapshot, Location, PauseDetector,
    PauseProbe, PausedThread, ResolvedThread, ThreadCache, ThreadOrigin, SNAPSHOT_LEVELS,
};
pub use variables::{
    BudgetLimit, ExpandOptions, MemoryBudget, ScopeFilter, ScopeNode, VariableNode, VariableWalker,
};
pub use wait::{wait_for_next_stop, wait_until_paused, DebugOutcome, WaitOptions};
