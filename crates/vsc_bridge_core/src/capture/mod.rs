//! Passive capture of debug adapter events and the read-only analyses run
//! over captured sessions.

pub mod compare;
pub mod digest;
pub mod search;
pub mod stats;
pub mod store;
pub mod timeline;

use serde::Serialize;

pub use store::{
    now_ms, CaptureStore, CapturedSession, ExceptionRecord, OutputEvent, OutputSource,
    StoppedEvent,
};

/// Identity block attached to most analysis results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRef {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub name: String,
}

impl From<&CapturedSession> for SessionRef {
    fn from(session: &CapturedSession) -> Self {
        Self {
            id: session.session_id.clone(),
            session_type: session.session_type.clone(),
            name: session.name.clone(),
        }
    }
}

/// Output trimmed for context windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputLine {
    pub ts: i64,
    pub category: String,
    pub text: String,
}

impl OutputLine {
    pub fn from_output(output: &OutputEvent, max_chars: usize) -> Self {
        Self {
            ts: output.ts,
            category: output.category.clone(),
            text: truncate_chars(&output.text, max_chars),
        }
    }
}

/// Output location reported back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<i64>,
    pub column: Option<i64>,
}

impl SourceLocation {
    pub fn from_output(output: &OutputEvent) -> Option<Self> {
        output.source.as_ref().map(|_| Self {
            file: output.source_path().map(str::to_string),
            line: output.line,
            column: output.column,
        })
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("", 3), "");
    }
}
