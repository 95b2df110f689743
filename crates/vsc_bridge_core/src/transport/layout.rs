//! On-disk layout of a bridge directory and the JSON records stored in it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

pub const HOST_FILE: &str = "host.json";
pub const LOCK_FILE: &str = "host.lock";
pub const GITIGNORE_FILE: &str = ".gitignore";
pub const EXECUTE_DIR: &str = "execute";

pub const COMMAND_FILE: &str = "command.json";
pub const CLAIMED_FILE: &str = "claimed.json";
pub const RESPONSE_FILE: &str = "response.json";
pub const ERROR_FILE: &str = "error.json";
pub const DATA_FILE: &str = "data.json";
pub const DONE_FILE: &str = "done";
pub const CANCEL_FILE: &str = "cancel";
pub const EVENTS_FILE: &str = "events.ndjson";
pub const DLQ_FILE: &str = "dlq";
pub const KEEP_FILE: &str = "keep";

pub fn execute_dir(bridge_root: &Path) -> PathBuf {
    bridge_root.join(EXECUTE_DIR)
}

/// Paths of the artifacts inside one job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDir {
    pub id: String,
    pub dir: PathBuf,
}

impl JobDir {
    pub fn new(bridge_root: &Path, id: impl Into<String>) -> Self {
        let id = id.into();
        let dir = execute_dir(bridge_root).join(&id);
        Self { id, dir }
    }

    pub fn from_dir(dir: PathBuf) -> Option<Self> {
        let id = dir.file_name()?.to_str()?.to_string();
        Some(Self { id, dir })
    }

    pub fn command(&self) -> PathBuf {
        self.dir.join(COMMAND_FILE)
    }

    pub fn claimed(&self) -> PathBuf {
        self.dir.join(CLAIMED_FILE)
    }

    pub fn response(&self) -> PathBuf {
        self.dir.join(RESPONSE_FILE)
    }

    pub fn error(&self) -> PathBuf {
        self.dir.join(ERROR_FILE)
    }

    pub fn data(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    pub fn done(&self) -> PathBuf {
        self.dir.join(DONE_FILE)
    }

    pub fn cancel(&self) -> PathBuf {
        self.dir.join(CANCEL_FILE)
    }

    pub fn events(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn dlq(&self) -> PathBuf {
        self.dir.join(DLQ_FILE)
    }

    pub fn keep(&self) -> PathBuf {
        self.dir.join(KEEP_FILE)
    }
}

/// Identity and liveness record of the running host (`host.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub bridge_id: String,
    pub version: u32,
    pub platform: String,
    pub workspace: String,
    pub pid: u32,
    pub started_at: String,
    pub timestamp: String,
}

/// A client request (`command.json`). Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFile {
    pub version: u32,
    pub client_id: String,
    pub id: String,
    pub created_at: String,
    pub script_name: String,
    #[serde(default)]
    pub params: Value,
    /// Milliseconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub bridge_id: String,
    pub claimed_at: String,
    pub pid: u32,
}

/// Dead-letter marker for jobs that failed inside the host or were lost in a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqRecord {
    pub reason: String,
    pub script_name: Option<String>,
    pub error: String,
    pub timestamp: String,
    pub pid: u32,
    pub bridge_id: String,
}

/// One line of `events.ndjson`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub ts: i64,
    pub seq: u64,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEventKind {
    Log { level: String, text: String },
    Progress { pct: u8, msg: String },
    Warn { text: String },
    Error {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_paths() {
        let job = JobDir::new(Path::new("/ws/.vsc-bridge"), "20250101T000000000Z-0001-abcd");
        assert_eq!(
            job.command(),
            PathBuf::from("/ws/.vsc-bridge/execute/20250101T000000000Z-0001-abcd/command.json")
        );
        assert!(job.done().ends_with("done"));
        let again = JobDir::from_dir(job.dir.clone()).expect("job from dir");
        assert_eq!(again, job);
    }

    #[test]
    fn test_command_file_wire_format() {
        let command = CommandFile {
            version: PROTOCOL_VERSION,
            client_id: "cli".into(),
            id: "abc".into(),
            created_at: "2025-01-01T00:00:00.000Z".into(),
            script_name: "breakpoint.set".into(),
            params: json!({"path": "/tmp/x.js", "line": 5}),
            timeout: 30000,
        };
        let value = serde_json::to_value(&command).expect("serialize");
        assert_eq!(value["clientId"], "cli");
        assert_eq!(value["scriptName"], "breakpoint.set");
        assert_eq!(value["createdAt"], "2025-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_job_event_line_shape() {
        let event = JobEvent {
            ts: 1,
            seq: 2,
            kind: JobEventKind::Progress {
                pct: 50,
                msg: "halfway".into(),
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value, json!({"ts": 1, "seq": 2, "type": "progress", "pct": 50, "msg": "halfway"}));
    }
}
