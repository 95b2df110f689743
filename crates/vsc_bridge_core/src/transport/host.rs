//! Host side of the bridge: owns the bridge directory, claims jobs, runs them
//! against an executor and writes their responses.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::envelope::Envelope;
use crate::transport::events::JobEvents;
use crate::transport::ids::is_valid_job_id;
use crate::transport::io;
use crate::transport::layout::{
    execute_dir, ClaimRecord, CommandFile, DlqRecord, HostInfo, JobDir, DATA_FILE, GITIGNORE_FILE,
    HOST_FILE, LOCK_FILE, PROTOCOL_VERSION,
};
use crate::transport::maintenance;
use crate::{BridgeError, ErrorCode, Result};

/// Serialized `data` above this size goes to `data.json` instead of the envelope.
pub const MAX_INLINE_DATA_BYTES: usize = 2 * 1024 * 1024;

const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const FAILURE_THRESHOLD: usize = 10;
/// A lock whose host.json is older than this is taken over.
const LOCK_TAKEOVER_AGE: Duration = Duration::from_secs(15);

/// Runs one decoded command to an envelope.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        command: CommandFile,
        cancel: CancellationToken,
        events: JobEvents,
    ) -> Envelope;
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct JobProcessor {
    bridge_root: PathBuf,
    bridge_id: String,
    config: HostConfig,
    executor: Arc<dyn CommandExecutor>,
    /// Job id to whether it was admitted under the concurrency limit.
    in_flight: Mutex<HashMap<String, bool>>,
    failures: Mutex<VecDeque<Instant>>,
}

// Removes the job from the in-flight set however processing ends.
struct InFlightSlot<'a> {
    processor: &'a JobProcessor,
    id: String,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.processor
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl JobProcessor {
    pub fn new(
        bridge_root: impl Into<PathBuf>,
        bridge_id: impl Into<String>,
        config: HostConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge_root: bridge_root.into(),
            bridge_id: bridge_id.into(),
            config,
            executor,
            in_flight: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Jobs currently admitted and running; rejected jobs are not counted.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|admitted| **admitted)
            .count()
    }

    /// Take the job's in-flight slot. `None` when it is already being handled,
    /// otherwise whether it fits under `max_concurrent`.
    fn admit(&self, id: &str) -> Option<bool> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.contains_key(id) {
            return None;
        }
        let running = in_flight.values().filter(|admitted| **admitted).count();
        let admitted = running < self.config.max_concurrent;
        in_flight.insert(id.to_string(), admitted);
        Some(admitted)
    }

    /// Find unclaimed jobs and start processing each. Returns how many were launched.
    pub async fn scan(self: &Arc<Self>) -> Result<usize> {
        let mut launched = 0;
        for job in maintenance::list_jobs(&self.bridge_root).await? {
            if !is_pending(&job).await {
                continue;
            }
            let Some(admitted) = self.admit(&job.id) else {
                continue;
            };
            launched += 1;
            let processor = Arc::clone(self);
            tokio::spawn(async move { processor.run_job(job, admitted).await });
        }
        Ok(launched)
    }

    /// Full lifecycle of one job: claim, guard, execute, respond, mark done.
    pub async fn process(&self, job: JobDir) {
        if let Some(admitted) = self.admit(&job.id) {
            self.run_job(job, admitted).await;
        }
    }

    async fn run_job(&self, job: JobDir, admitted: bool) {
        let _slot = InFlightSlot {
            processor: self,
            id: job.id.clone(),
        };
        if !is_valid_job_id(&job.id) {
            tracing::warn!("Ignoring job with invalid id: {}", job.id);
            return;
        }

        let command = io::read_json::<CommandFile>(&job.command()).await;
        match self.claim(&job).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!("Failed to claim job: job={}, error={}", job.id, e);
                return;
            }
        }

        let command = match command {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                let envelope = Envelope::error(ErrorCode::InvalidParams, format!("Malformed command.json: {e}"));
                self.finish(&job, envelope, &JobEvents::disabled()).await;
                return;
            }
        };

        if let Some(retry_after) = self.circuit_retry_after() {
            tracing::warn!("Circuit open, rejecting job: job={}, script={}", job.id, command.script_name);
            let envelope = Envelope::error(
                ErrorCode::CircuitOpen,
                format!("Too many failures, retry after {retry_after}s"),
            )
            .with_details(json!({ "retryAfter": retry_after }));
            self.finish(&job, envelope, &JobEvents::disabled()).await;
            return;
        }

        if !admitted {
            tracing::debug!("Rejecting job over capacity: job={}", job.id);
            let envelope = Envelope::error(
                ErrorCode::Capacity,
                format!(
                    "Capacity limit reached ({} concurrent jobs)",
                    self.config.max_concurrent
                ),
            );
            self.finish(&job, envelope, &JobEvents::disabled()).await;
            return;
        }

        let events = match JobEvents::open(&job.events()).await {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!("Job events unavailable: job={}, error={}", job.id, e);
                JobEvents::disabled()
            }
        };
        let envelope = self.execute(&job, command, &events).await;
        if !io::exists(&job.dir).await {
            tracing::debug!("Job directory vanished before response: job={}", job.id);
            return;
        }
        self.finish(&job, envelope, &events).await;
    }

    async fn claim(&self, job: &JobDir) -> Result<bool> {
        let record = ClaimRecord {
            bridge_id: self.bridge_id.clone(),
            claimed_at: now_iso(),
            pid: std::process::id(),
        };
        let bytes = serde_json::to_vec(&record)?;
        io::create_exclusive(&job.claimed(), &bytes).await
    }

    async fn execute(&self, job: &JobDir, command: CommandFile, events: &JobEvents) -> Envelope {
        let script_name = command.script_name.clone();
        tracing::info!("Executing job: job={}, script={}", job.id, script_name);
        events.log("info", format!("Executing {script_name}")).await;

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_for_cancel(
            job.clone(),
            cancel.clone(),
            self.config.cancel_poll_interval,
        ));

        let executor = Arc::clone(&self.executor);
        let task_events = events.clone();
        let task_cancel = cancel.child_token();
        let task = tokio::spawn(async move { executor.execute(command, task_cancel, task_events).await });

        let envelope = tokio::select! {
            joined = task => match joined {
                Ok(envelope) => envelope,
                Err(e) => {
                    let message = format!("Script execution failed: {e}");
                    tracing::error!("Job failed inside host: job={}, error={}", job.id, message);
                    self.write_dlq(job, "E_INTERNAL", Some(&script_name), &message).await;
                    events.error(message.clone(), None).await;
                    Envelope::error(ErrorCode::Internal, message)
                }
            },
            _ = cancel.cancelled() => {
                tracing::info!("Job cancelled: job={}, script={}", job.id, script_name);
                Envelope::error(ErrorCode::Cancelled, ErrorCode::Cancelled.default_message())
            }
        };
        // Stops the watcher and any work still observing the child token.
        cancel.cancel();
        watcher.abort();

        if envelope.error_code() == Some(ErrorCode::Internal.as_str()) {
            self.record_failure();
        }
        envelope
    }

    /// response.json, then close events, then the `done` marker.
    async fn finish(&self, job: &JobDir, mut envelope: Envelope, events: &JobEvents) {
        if let Err(e) = self.write_response(job, &mut envelope).await {
            tracing::error!("Failed to write response: job={}, error={}", job.id, e);
        }
        events
            .log("info", if envelope.ok { "Completed" } else { "Failed" })
            .await;
        events.close().await;
        if let Err(e) = io::touch(&job.done()).await {
            tracing::error!("Failed to write done marker: job={}, error={}", job.id, e);
        }
    }

    async fn write_response(&self, job: &JobDir, envelope: &mut Envelope) -> Result<()> {
        if let Some(data) = &envelope.data {
            let size = serde_json::to_vec(data)?.len();
            if size > MAX_INLINE_DATA_BYTES {
                tracing::debug!("Spilling large response: job={}, bytes={}", job.id, size);
                io::write_json_atomic(&job.data(), data).await?;
                envelope.data = None;
                envelope.data_ref = Some(DATA_FILE.to_string());
            }
        }
        io::write_json_atomic(&job.response(), envelope).await
    }

    async fn write_dlq(&self, job: &JobDir, reason: &str, script_name: Option<&str>, error: &str) {
        let record = DlqRecord {
            reason: reason.to_string(),
            script_name: script_name.map(str::to_string),
            error: error.to_string(),
            timestamp: now_iso(),
            pid: std::process::id(),
            bridge_id: self.bridge_id.clone(),
        };
        if let Err(e) = io::write_json_atomic(&job.dlq(), &record).await {
            tracing::warn!("Failed to write dlq marker: job={}, error={}", job.id, e);
        }
    }

    fn record_failure(&self) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.push_back(Instant::now());
        while failures.len() > FAILURE_THRESHOLD {
            failures.pop_front();
        }
    }

    /// Seconds until the circuit closes again, if it is open.
    fn circuit_retry_after(&self) -> Option<u64> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        while failures.front().is_some_and(|t| t.elapsed() > FAILURE_WINDOW) {
            failures.pop_front();
        }
        if failures.len() < FAILURE_THRESHOLD {
            return None;
        }
        let oldest = failures.front()?.elapsed();
        let remaining = FAILURE_WINDOW.saturating_sub(oldest);
        Some(remaining.as_secs_f64().ceil().max(1.0) as u64)
    }
}

async fn is_pending(job: &JobDir) -> bool {
    io::exists(&job.command()).await
        && !io::exists(&job.claimed()).await
        && !io::exists(&job.done()).await
        && !io::exists(&job.dlq()).await
}

/// Cancels `token` when the client drops a `cancel` marker or removes the job.
async fn watch_for_cancel(job: JobDir, token: CancellationToken, every: Duration) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(every) => {}
        }
        if io::exists(&job.cancel()).await || !io::exists(&job.dir).await {
            tracing::debug!("Cancel requested: job={}", job.id);
            token.cancel();
            return;
        }
    }
}

/// The long-lived host: directory ownership, heartbeat, job scanning and GC.
pub struct BridgeHost {
    bridge_root: PathBuf,
    config: HostConfig,
    info: HostInfo,
    processor: Arc<JobProcessor>,
}

impl BridgeHost {
    /// Take ownership of `<workspace>/.vsc-bridge` and recover from a previous run.
    pub async fn start(config: HostConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let bridge_root = config.bridge_root();
        tokio::fs::create_dir_all(execute_dir(&bridge_root)).await?;
        let gitignore = bridge_root.join(GITIGNORE_FILE);
        if !io::exists(&gitignore).await {
            io::write_atomic(&gitignore, b"*\n").await?;
        }

        let bridge_id = format!("host-{}", uuid::Uuid::new_v4());
        acquire_lock(&bridge_root, &bridge_id).await?;

        let started_at = now_iso();
        let info = HostInfo {
            bridge_id: bridge_id.clone(),
            version: PROTOCOL_VERSION,
            platform: std::env::consts::OS.to_string(),
            workspace: config.workspace.display().to_string(),
            pid: std::process::id(),
            started_at: started_at.clone(),
            timestamp: started_at,
        };
        io::write_json_atomic(&bridge_root.join(HOST_FILE), &info).await?;

        let report = maintenance::recover_on_startup(&bridge_root, &bridge_id).await?;
        tracing::info!(
            "Bridge host started: root={}, quarantined={}, removed_pending={}, removed_orphans={}",
            bridge_root.display(),
            report.quarantined,
            report.removed_pending,
            report.removed_orphans
        );

        let processor = JobProcessor::new(&bridge_root, &bridge_id, config.clone(), executor);
        Ok(Self {
            bridge_root,
            config,
            info,
            processor,
        })
    }

    pub fn bridge_root(&self) -> &Path {
        &self.bridge_root
    }

    pub fn info(&self) -> &HostInfo {
        &self.info
    }

    pub fn processor(&self) -> &Arc<JobProcessor> {
        &self.processor
    }

    /// Serve until `shutdown` fires, then release the bridge directory.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        let mut scan = interval(self.config.scan_interval);
        let mut gc = interval(self.config.gc_interval);
        for ticker in [&mut heartbeat, &mut scan, &mut gc] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        tracing::warn!("Heartbeat failed: {}", e);
                    }
                }
                _ = scan.tick() => {
                    if self.processor.in_flight() >= self.config.max_concurrent {
                        continue;
                    }
                    match self.processor.scan().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("Launched {} job(s)", n),
                        Err(e) => tracing::warn!("Job scan failed: {}", e),
                    }
                }
                _ = gc.tick() => {
                    match maintenance::collect_garbage(&self.bridge_root, self.config.max_job_age).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Garbage collected {} job(s)", n),
                        Err(e) => tracing::warn!("Garbage collection failed: {}", e),
                    }
                }
            }
        }

        self.release().await;
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<()> {
        self.info.timestamp = now_iso();
        io::write_json_atomic(&self.bridge_root.join(HOST_FILE), &self.info).await
    }

    async fn release(&self) {
        for file in [HOST_FILE, LOCK_FILE] {
            let path = self.bridge_root.join(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
        tracing::info!("Bridge host stopped: root={}", self.bridge_root.display());
    }
}

async fn acquire_lock(bridge_root: &Path, bridge_id: &str) -> Result<()> {
    let lock = bridge_root.join(LOCK_FILE);
    let record = serde_json::to_vec(&json!({
        "bridgeId": bridge_id,
        "pid": std::process::id(),
        "acquiredAt": now_iso(),
    }))?;
    if io::create_exclusive(&lock, &record).await? {
        return Ok(());
    }

    let host_age = io::age(&bridge_root.join(HOST_FILE)).await;
    if host_age.map_or(true, |age| age > LOCK_TAKEOVER_AGE) {
        tracing::warn!("Taking over stale bridge lock: {}", lock.display());
        io::write_atomic(&lock, &record).await?;
        return Ok(());
    }

    let owner = io::read_json::<serde_json::Value>(&lock)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.get("pid").and_then(|p| p.as_u64()))
        .unwrap_or(0) as u32;
    Err(BridgeError::HostLocked(owner))
}
