use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::{BridgeConfig, BRIDGE_DIR_NAME};
use crate::envelope::Envelope;
use crate::transport::ids::sortable_id;
use crate::transport::io;
use crate::transport::layout::{execute_dir, CommandFile, HostInfo, JobDir, HOST_FILE, PROTOCOL_VERSION};
use crate::{BridgeError, Result};

/// host.json older than this means the host is gone.
pub const HEALTHY_THRESHOLD: Duration = Duration::from_secs(30);

const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runs against a job directory right before it is removed.
pub type JobInspector = Arc<dyn Fn(&JobDir) -> std::io::Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BridgeHealth {
    pub healthy: bool,
    pub host: Option<HostInfo>,
    pub age: Option<Duration>,
    pub diagnostic: String,
}

/// Read `host.json` and judge liveness from its mtime.
pub async fn check_health(bridge_root: &Path) -> BridgeHealth {
    let host_file = bridge_root.join(HOST_FILE);
    let Some(age) = io::age(&host_file).await else {
        return BridgeHealth {
            healthy: false,
            host: None,
            age: None,
            diagnostic: format!("host.json not found in {}", bridge_root.display()),
        };
    };
    let host = io::read_json::<HostInfo>(&host_file).await.ok().flatten();
    let healthy = age < HEALTHY_THRESHOLD;
    let diagnostic = if healthy {
        format!("host.json age {}s", age.as_secs())
    } else {
        format!("host.json age {}s (stale)", age.as_secs())
    };
    BridgeHealth {
        healthy,
        host,
        age: Some(age),
        diagnostic,
    }
}

/// Walk up from `start` looking for a bridge directory.
pub fn find_bridge_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(BRIDGE_DIR_NAME))
        .find(|candidate| candidate.join(HOST_FILE).is_file() || candidate.join("execute").is_dir())
}

#[derive(Clone)]
pub struct BridgeClient {
    config: BridgeConfig,
    client_id: String,
    inspector: Option<JobInspector>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            client_id: format!("client-{}", uuid::Uuid::new_v4()),
            inspector: None,
        }
    }

    pub fn from_env() -> Self {
        Self::new(BridgeConfig::from_env())
    }

    pub fn with_inspector(mut self, inspector: JobInspector) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn bridge_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.config.bridge_root {
            return Ok(root.clone());
        }
        let cwd = std::env::current_dir()?;
        find_bridge_root(&cwd).ok_or_else(|| {
            BridgeError::Unavailable(format!(
                "no {BRIDGE_DIR_NAME} directory found above {}",
                cwd.display()
            ))
        })
    }

    /// Run with the configured timeout and no external cancellation.
    pub async fn run(&self, script_name: &str, params: Value) -> Envelope {
        self.run_command(script_name, params, self.config.timeout, &CancellationToken::new())
            .await
    }

    /// Submit one command and wait for its envelope. Every outcome, including
    /// transport failures, comes back as an envelope.
    pub async fn run_command(
        &self,
        script_name: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Envelope {
        let started = Instant::now();
        let root = match self.bridge_root() {
            Ok(root) => root,
            Err(e) => return transport_failure(e),
        };

        let health = check_health(&root).await;
        if !health.healthy {
            return Envelope::error(
                crate::ErrorCode::BridgeUnavailable,
                format!("Bridge host is not running: {}", health.diagnostic),
            )
            .with_details(json!({ "bridgeRoot": root.display().to_string() }));
        }

        let job = JobDir::new(&root, sortable_id());
        let result = self
            .submit_and_wait(&job, script_name, params, timeout, cancel, started)
            .await;
        self.cleanup(&job).await;

        match result {
            Ok(envelope) => envelope,
            Err(e) => transport_failure(e).with_details(json!({ "jobId": job.id })),
        }
    }

    async fn submit_and_wait(
        &self,
        job: &JobDir,
        script_name: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Envelope> {
        tokio::fs::create_dir_all(&job.dir).await?;
        let command = CommandFile {
            version: PROTOCOL_VERSION,
            client_id: self.client_id.clone(),
            id: job.id.clone(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            script_name: script_name.to_string(),
            params,
            timeout: timeout.as_millis() as u64,
        };
        io::write_json_atomic(&job.command(), &command).await?;
        tracing::debug!("Submitted command: script={}, job={}", script_name, job.id);

        let deadline = started + timeout;
        let pickup_deadline = started + timeout.min(self.config.pickup_timeout);

        // Pickup: the host acknowledges by claiming the job.
        loop {
            if io::exists(&job.claimed()).await || io::exists(&job.done()).await {
                break;
            }
            if Instant::now() >= pickup_deadline {
                io::touch(&job.cancel()).await.ok();
                return Err(if pickup_deadline >= deadline {
                    BridgeError::Timeout(timeout)
                } else {
                    BridgeError::PickupTimeout(self.config.pickup_timeout)
                });
            }
            self.pause(pickup_deadline, job, cancel).await?;
        }

        loop {
            if io::exists(&job.done()).await {
                break;
            }
            if Instant::now() >= deadline {
                tracing::debug!("Command timed out: job={}", job.id);
                io::touch(&job.cancel()).await.ok();
                return Err(BridgeError::Timeout(timeout));
            }
            self.pause(deadline, job, cancel).await?;
        }

        read_envelope(job).await
    }

    // Sleeps one poll interval without overshooting `deadline`.
    async fn pause(&self, deadline: Instant, job: &JobDir, cancel: &CancellationToken) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            _ = sleep(self.config.poll_interval.min(remaining)) => Ok(()),
            _ = cancel.cancelled() => {
                tracing::debug!("Command cancelled: job={}", job.id);
                io::touch(&job.cancel()).await.ok();
                Err(BridgeError::Cancelled)
            }
        }
    }

    async fn cleanup(&self, job: &JobDir) {
        if let Some(inspector) = &self.inspector {
            if let Err(e) = inspector(job) {
                tracing::warn!("Job inspection failed: job={}, error={}", job.id, e);
            }
        }
        let removal = retry_removal(CLEANUP_ATTEMPTS, CLEANUP_RETRY_DELAY, || io::remove_dir_all(&job.dir)).await;
        if let Err(e) = removal {
            tracing::warn!("Failed to remove job directory: job={}, error={}", job.id, e);
        }
    }
}

/// The host may still be writing into the directory while it is removed,
/// which fails with ENOTEMPTY; later attempts see the finished files.
async fn retry_removal<F, Fut>(attempts: u32, delay: Duration, mut remove: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut attempt = 1;
    loop {
        match remove().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                tracing::debug!("Retrying directory removal: attempt={}, error={}", attempt, e);
                attempt += 1;
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_envelope(job: &JobDir) -> Result<Envelope> {
    let envelope = match io::read_json::<Envelope>(&job.response()).await? {
        Some(envelope) => envelope,
        None => io::read_json::<Envelope>(&job.error())
            .await?
            .ok_or(BridgeError::NoResponse)?,
    };
    inline_data_ref(job, envelope).await
}

async fn inline_data_ref(job: &JobDir, mut envelope: Envelope) -> Result<Envelope> {
    if let Some(data_ref) = envelope.data_ref.take() {
        let path = job.dir.join(&data_ref);
        let data: Value = io::read_json(&path)
            .await?
            .ok_or_else(|| BridgeError::InvalidResponse(format!("missing {data_ref}")))?;
        envelope.data = Some(data);
    }
    Ok(envelope)
}

fn transport_failure(err: BridgeError) -> Envelope {
    Envelope::error(err.code(), err.to_string())
}

/// Number of job directories currently present (diagnostics only).
pub async fn pending_jobs(bridge_root: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(execute_dir(bridge_root)).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            count += 1;
        }
    }
    count
}
