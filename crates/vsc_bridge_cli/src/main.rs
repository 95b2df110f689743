mod params;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vsc_bridge_core::format::render;
use vsc_bridge_core::transport::client::pending_jobs;
use vsc_bridge_core::transport::layout::{JobDir, JobEvent, JobEventKind};
use vsc_bridge_core::transport::{check_health, JobInspector};
use vsc_bridge_core::{BridgeClient, BridgeConfig, Envelope};

/// Drive a running bridge host from the command line.
#[derive(Debug, Parser)]
#[command(name = "vscb", version, about)]
struct Cli {
    /// Bridge directory; searched upward from the current directory when unset.
    #[arg(long, global = true, env = "VSC_BRIDGE_ROOT")]
    bridge_root: Option<PathBuf>,

    /// Print the raw envelope as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one script: `vscb script breakpoint.set path=src/app.js line=12`.
    Script {
        name: String,
        /// `key=value` parameters.
        pairs: Vec<String>,
        /// Base parameters as a JSON object.
        #[arg(long)]
        params: Option<String>,
        /// Overall timeout in milliseconds.
        #[arg(long, env = "VSC_BRIDGE_TIMEOUT_MS")]
        timeout: Option<u64>,
    },
    /// Report whether a host is serving the bridge directory.
    Status,
    /// List the scripts the host serves.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = BridgeConfig::from_env();
    if let Some(root) = &cli.bridge_root {
        config.bridge_root = Some(root.clone());
    }

    match cli.command {
        Command::Script {
            name,
            pairs,
            params,
            timeout,
        } => {
            let params = params::build(params.as_deref(), &pairs)?;
            let timeout = params::client_timeout(timeout.map_or(config.timeout, Duration::from_millis), &params);
            let client = BridgeClient::new(config).with_inspector(print_events());
            let envelope = run_cancellable(&client, &name, params, timeout).await;
            Ok(report(&envelope, cli.json))
        }
        Command::Status => status(BridgeClient::new(config), cli.json).await,
        Command::List => {
            let client = BridgeClient::new(config);
            let timeout = client.config().timeout;
            let envelope = run_cancellable(&client, "script.list", json!({}), timeout).await;
            if cli.json || !envelope.ok {
                return Ok(report(&envelope, cli.json));
            }
            let scripts = envelope
                .data
                .as_ref()
                .and_then(|d| d.get("scripts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for script in &scripts {
                println!(
                    "{:<28} {:<9} {}",
                    script["name"].as_str().unwrap_or_default(),
                    script["kind"].as_str().unwrap_or_default(),
                    script["description"].as_str().unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Ctrl-C drops a cancel marker for the host instead of abandoning the job.
async fn run_cancellable(client: &BridgeClient, name: &str, params: Value, timeout: Duration) -> Envelope {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    let envelope = client.run_command(name, params, timeout, &cancel).await;
    watcher.abort();
    envelope
}

fn report(envelope: &Envelope, as_json: bool) -> ExitCode {
    let rendered = render(envelope);
    if as_json {
        match serde_json::to_string_pretty(envelope) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("Failed to encode envelope: {e}"),
        }
    } else if rendered.failed {
        eprintln!("{}", rendered.text);
    } else {
        println!("{}", rendered.text);
    }
    if rendered.failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn status(client: BridgeClient, as_json: bool) -> anyhow::Result<ExitCode> {
    let root = client.bridge_root()?;
    let health = check_health(&root).await;
    let pending = pending_jobs(&root).await;

    if as_json {
        let report = json!({
            "bridgeRoot": root.display().to_string(),
            "healthy": health.healthy,
            "ageMs": health.age.map(|age| age.as_millis() as u64),
            "host": health.host,
            "pendingJobs": pending,
            "diagnostic": health.diagnostic,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if health.healthy {
        println!("✓ Bridge host is running: {}", health.diagnostic);
        if let Some(host) = &health.host {
            println!("  pid {} on {}, serving {}", host.pid, host.platform, host.workspace);
        }
        println!("  {pending} job(s) pending in {}", root.display());
    } else {
        eprintln!("✗ [E_BRIDGE_UNAVAILABLE] {}", health.diagnostic);
    }

    Ok(if health.healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Echo the job's event stream to stderr before its directory goes away.
fn print_events() -> JobInspector {
    Arc::new(|job: &JobDir| {
        let raw = match std::fs::read_to_string(job.events()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(event) = serde_json::from_str::<JobEvent>(line) else {
                tracing::debug!("Skipping malformed event line: {}", line);
                continue;
            };
            match event.kind {
                JobEventKind::Log { level, text } => eprintln!("[{level}] {text}"),
                JobEventKind::Progress { pct, msg } => eprintln!("[{pct:>3}%] {msg}"),
                JobEventKind::Warn { text } => eprintln!("[warn] {text}"),
                JobEventKind::Error { text, .. } => eprintln!("[error] {text}"),
            }
        }
        Ok(())
    })
}
