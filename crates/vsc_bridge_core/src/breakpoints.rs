//! Source breakpoints kept by the host and pushed to the active session one
//! file at a time.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::debug::DebugSession;
use crate::error::DapError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub path: String,
    pub line: i64,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
    pub enabled: bool,
    pub verified: bool,
}

impl Breakpoint {
    pub fn new(path: impl Into<String>, line: i64) -> Self {
        Self {
            path: path.into(),
            line,
            condition: None,
            hit_condition: None,
            log_message: None,
            enabled: true,
            verified: true,
        }
    }

    fn to_source_breakpoint(&self) -> Value {
        let mut bp = json!({ "line": self.line });
        if let Some(condition) = &self.condition {
            bp["condition"] = json!(condition);
        }
        if let Some(hit_condition) = &self.hit_condition {
            bp["hitCondition"] = json!(hit_condition);
        }
        if let Some(log_message) = &self.log_message {
            bp["logMessage"] = json!(log_message);
        }
        bp
    }
}

#[derive(Debug, Default)]
pub struct BreakpointStore {
    files: RwLock<BTreeMap<String, BTreeMap<i64, Breakpoint>>>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the breakpoint on that line.
    pub async fn set(&self, breakpoint: Breakpoint) {
        self.files
            .write()
            .await
            .entry(breakpoint.path.clone())
            .or_default()
            .insert(breakpoint.line, breakpoint);
    }

    pub async fn remove(&self, path: &str, line: i64) -> Option<Breakpoint> {
        let mut files = self.files.write().await;
        let lines = files.get_mut(path)?;
        let removed = lines.remove(&line);
        if lines.is_empty() {
            files.remove(path);
        }
        removed
    }

    /// Every breakpoint, ordered by path then line.
    pub async fn list(&self) -> Vec<Breakpoint> {
        self.files
            .read()
            .await
            .values()
            .flat_map(|lines| lines.values().cloned())
            .collect()
    }

    pub async fn for_file(&self, path: &str) -> Vec<Breakpoint> {
        self.files
            .read()
            .await
            .get(path)
            .map(|lines| lines.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn files(&self) -> Vec<String> {
        self.files.read().await.keys().cloned().collect()
    }

    pub async fn clear_file(&self, path: &str) -> usize {
        self.files
            .write()
            .await
            .remove(path)
            .map_or(0, |lines| lines.len())
    }

    pub async fn clear(&self) -> usize {
        let mut files = self.files.write().await;
        let cleared = files.values().map(BTreeMap::len).sum();
        files.clear();
        cleared
    }
}

/// Replace the adapter's breakpoints for `path`. Returns the adapter's view.
pub async fn sync_file(
    session: &dyn DebugSession,
    path: &str,
    breakpoints: &[Breakpoint],
) -> Result<Vec<Value>, DapError> {
    let source_breakpoints: Vec<Value> = breakpoints
        .iter()
        .filter(|bp| bp.enabled)
        .map(Breakpoint::to_source_breakpoint)
        .collect();
    let body = session
        .request(
            "setBreakpoints",
            json!({
                "source": { "path": path },
                "breakpoints": source_breakpoints,
                "sourceModified": false,
            }),
        )
        .await?;
    Ok(body
        .get("breakpoints")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}
