use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::transport::layout::{JobEvent, JobEventKind};

/// Appends `events.ndjson` lines for one job. Cheap to clone; a disabled
/// writer silently drops events.
#[derive(Debug, Clone, Default)]
pub struct JobEvents {
    inner: Option<Arc<EventsInner>>,
}

#[derive(Debug)]
struct EventsInner {
    file: Mutex<Option<File>>,
    seq: AtomicU64,
}

impl JobEvents {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            inner: Some(Arc::new(EventsInner {
                file: Mutex::new(Some(file)),
                seq: AtomicU64::new(0),
            })),
        })
    }

    pub async fn log(&self, level: &str, text: impl Into<String>) {
        self.emit(JobEventKind::Log {
            level: level.to_string(),
            text: text.into(),
        })
        .await;
    }

    pub async fn progress(&self, pct: u8, msg: impl Into<String>) {
        self.emit(JobEventKind::Progress {
            pct: pct.min(100),
            msg: msg.into(),
        })
        .await;
    }

    pub async fn warn(&self, text: impl Into<String>) {
        self.emit(JobEventKind::Warn { text: text.into() }).await;
    }

    pub async fn error(&self, text: impl Into<String>, data: Option<Value>) {
        self.emit(JobEventKind::Error {
            text: text.into(),
            data,
        })
        .await;
    }

    /// Flush and stop accepting events. Later events are dropped.
    pub async fn close(&self) {
        let Some(inner) = &self.inner else { return };
        if let Some(mut file) = inner.file.lock().await.take() {
            if let Err(e) = file.flush().await {
                tracing::debug!("Failed to flush job events: {}", e);
            }
        }
    }

    async fn emit(&self, kind: JobEventKind) {
        let Some(inner) = &self.inner else { return };
        let event = JobEvent {
            ts: Utc::now().timestamp_millis(),
            seq: inner.seq.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        let Ok(mut line) = serde_json::to_vec(&event) else {
            return;
        };
        line.push(b'\n');
        let mut guard = inner.file.lock().await;
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(&line).await {
                tracing::debug!("Failed to write job event: {}", e);
            }
        }
    }
}
