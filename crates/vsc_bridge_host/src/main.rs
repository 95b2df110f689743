mod dap;
mod scripts;
mod sessions;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vsc_bridge_core::{BridgeContext, BridgeHost, CaptureStore, Dispatcher, HostConfig, Registry};

use crate::sessions::SessionManager;

/// Long-lived bridge host: serves jobs from `<workspace>/.vsc-bridge` and
/// drives one debug adapter at a time.
#[derive(Debug, Parser)]
#[command(name = "vsc_bridge_host", version, about)]
struct Cli {
    /// Workspace root that holds the bridge directory.
    #[arg(long, env = "VSC_BRIDGE_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Jobs allowed to run at once.
    #[arg(long, env = "VSC_BRIDGE_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Timeout for a single debug adapter request.
    #[arg(long, env = "VSC_BRIDGE_DAP_TIMEOUT_MS")]
    dap_timeout_ms: Option<u64>,
}

impl Cli {
    fn host_config(&self) -> HostConfig {
        let mut config = HostConfig::from_env();
        if let Some(workspace) = &self.workspace {
            config.workspace = workspace.clone();
        }
        if let Some(max) = self.max_concurrent.filter(|max| *max > 0) {
            config.max_concurrent = max;
        }
        if let Some(ms) = self.dap_timeout_ms {
            config.dap_request_timeout = Duration::from_millis(ms);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Cli::parse().host_config();
    let sessions = Arc::new(SessionManager::new());

    let mut registry = Registry::with_builtin_scripts();
    for script in scripts::host_scripts(sessions.clone(), config.dap_request_timeout) {
        registry.register(script).context("registering host scripts")?;
    }
    tracing::info!("Registered {} scripts", registry.len());

    let bridge = BridgeContext::new(&config.workspace, sessions.clone(), Arc::new(CaptureStore::new()));
    let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(bridge));

    let workspace = config.workspace.clone();
    let mut host = BridgeHost::start(config, Arc::new(dispatcher))
        .await
        .with_context(|| format!("starting bridge host in {}", workspace.display()))?;
    tracing::info!("Bridge host serving {}", host.bridge_root().display());

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
        tracing::info!("Shutting down bridge host...");
        on_signal.cancel();
    });

    host.run(shutdown).await?;

    if let Some(session) = sessions.take() {
        session.shutdown();
    }
    Ok(())
}
