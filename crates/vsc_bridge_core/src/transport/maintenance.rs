//! Startup recovery and garbage collection of job directories.

use std::path::Path;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use crate::envelope::Envelope;
use crate::transport::io;
use crate::transport::layout::{execute_dir, DlqRecord, JobDir};
use crate::{ErrorCode, Result};

const ORPHAN_AGE: Duration = Duration::from_secs(60);
const STRAY_TMP_AGE: Duration = Duration::from_secs(60);
const DLQ_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub quarantined: usize,
    pub removed_pending: usize,
    pub removed_orphans: usize,
}

/// All job directories under `execute/`, in id order.
pub async fn list_jobs(bridge_root: &Path) -> Result<Vec<JobDir>> {
    let dir = execute_dir(bridge_root);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut jobs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(job) = JobDir::from_dir(entry.path()) {
            jobs.push(job);
        }
    }
    jobs.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(jobs)
}

/// Clean up after a previous host that died mid-flight.
///
/// Claimed-but-unfinished jobs are quarantined with a dlq marker and answered
/// with `E_CRASH_RECOVERY`; unclaimed pending jobs are dropped; directories
/// that never received a command are removed once they are old enough.
pub async fn recover_on_startup(bridge_root: &Path, bridge_id: &str) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for job in list_jobs(bridge_root).await? {
        let has_command = io::exists(&job.command()).await;
        let done = io::exists(&job.done()).await;
        let dlq = io::exists(&job.dlq()).await;
        let keep = io::exists(&job.keep()).await;

        if !has_command {
            if io::age(&job.dir).await.is_some_and(|age| age > ORPHAN_AGE) {
                remove_job(&job).await;
                report.removed_orphans += 1;
            }
            continue;
        }

        if io::exists(&job.claimed()).await && !done && !dlq {
            quarantine(&job, bridge_id).await?;
            report.quarantined += 1;
            continue;
        }

        if !done && !dlq && !keep {
            remove_job(&job).await;
            report.removed_pending += 1;
        }
    }
    Ok(report)
}

async fn quarantine(job: &JobDir, bridge_id: &str) -> Result<()> {
    let script_name = io::read_json::<serde_json::Value>(&job.command())
        .await
        .ok()
        .flatten()
        .and_then(|c| c.get("scriptName").and_then(|s| s.as_str()).map(str::to_string));
    tracing::warn!("Quarantining crashed job: job={}, script={:?}", job.id, script_name);

    let message = "Host stopped while this job was running";
    let record = DlqRecord {
        reason: ErrorCode::CrashRecovery.as_str().to_string(),
        script_name,
        error: message.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        pid: std::process::id(),
        bridge_id: bridge_id.to_string(),
    };
    io::write_json_atomic(&job.dlq(), &record).await?;
    io::write_json_atomic(&job.response(), &Envelope::error(ErrorCode::CrashRecovery, message)).await?;
    io::touch(&job.done()).await
}

async fn remove_job(job: &JobDir) {
    if let Err(e) = io::remove_dir_all(&job.dir).await {
        tracing::warn!("Failed to remove job directory: job={}, error={}", job.id, e);
    }
}

/// Remove finished jobs older than `max_age` (dlq jobs are kept longer, jobs
/// marked `keep` forever). Returns the number of job directories removed.
pub async fn collect_garbage(bridge_root: &Path, max_age: Duration) -> Result<usize> {
    remove_stray_tmp_files(bridge_root).await;

    let mut removed = 0;
    for job in list_jobs(bridge_root).await? {
        if io::exists(&job.keep()).await {
            continue;
        }
        remove_stray_tmp_files(&job.dir).await;

        let expired = match io::age(&job.done()).await {
            Some(done_age) => {
                let limit = if io::exists(&job.dlq()).await {
                    DLQ_RETENTION
                } else {
                    max_age
                };
                done_age > limit
            }
            None => io::age(&job.dir).await.is_some_and(|age| age > max_age * 2),
        };
        if expired {
            tracing::debug!("Collecting job: {}", job.id);
            remove_job(&job).await;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn remove_stray_tmp_files(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_tmp = path.extension().is_some_and(|ext| ext == "tmp");
        if is_tmp && io::age(&path).await.is_some_and(|age| age > STRAY_TMP_AGE) {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn job_with(root: &Path, id: &str, files: &[&str]) -> JobDir {
        let job = JobDir::new(root, id);
        tokio::fs::create_dir_all(&job.dir).await.expect("mkdir");
        for file in files {
            let path = job.dir.join(file);
            if file.ends_with(".json") {
                io::write_json_atomic(&path, &serde_json::json!({"scriptName": "debug.status"}))
                    .await
                    .expect("write");
            } else {
                io::touch(&path).await.expect("touch");
            }
        }
        job
    }

    #[tokio::test]
    async fn test_recovery_quarantines_and_cleans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let crashed = job_with(root, "a-crashed", &["command.json", "claimed.json"]).await;
        let pending = job_with(root, "b-pending", &["command.json"]).await;
        let finished = job_with(root, "c-finished", &["command.json", "response.json", "done"]).await;
        let kept = job_with(root, "d-kept", &["command.json", "keep"]).await;
        let fresh_orphan = job_with(root, "e-orphan", &[]).await;

        let report = recover_on_startup(root, "bridge").await.expect("recover");

        assert_eq!(
            report,
            RecoveryReport {
                quarantined: 1,
                removed_pending: 1,
                removed_orphans: 0,
            }
        );
        let dlq: DlqRecord = io::read_json(&crashed.dlq()).await.expect("read").expect("dlq");
        assert_eq!(dlq.reason, "E_CRASH_RECOVERY");
        assert_eq!(dlq.script_name.as_deref(), Some("debug.status"));
        assert!(io::exists(&crashed.done()).await);
        assert!(!io::exists(&pending.dir).await);
        assert!(io::exists(&finished.dir).await);
        assert!(io::exists(&kept.dir).await);
        assert!(io::exists(&fresh_orphan.dir).await);
    }

    #[tokio::test]
    async fn test_gc_respects_age_and_keep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let finished = job_with(root, "a-finished", &["command.json", "done"]).await;
        let kept = job_with(root, "b-kept", &["command.json", "done", "keep"]).await;
        let dead = job_with(root, "c-dlq", &["command.json", "done", "dlq"]).await;

        assert_eq!(collect_garbage(root, Duration::from_secs(3600)).await.expect("gc"), 0);
        assert!(io::exists(&finished.dir).await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = collect_garbage(root, Duration::from_millis(1)).await.expect("gc");
        assert_eq!(removed, 1);
        assert!(!io::exists(&finished.dir).await);
        assert!(io::exists(&kept.dir).await);
        assert!(io::exists(&dead.dir).await, "dlq jobs are retained longer");
    }

    #[tokio::test]
    async fn test_list_jobs_sorted_and_missing_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(list_jobs(dir.path()).await.expect("list").is_empty());
        job_with(dir.path(), "b", &[]).await;
        job_with(dir.path(), "a", &[]).await;
        let ids: Vec<String> = list_jobs(dir.path()).await.expect("list").into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
