//! Client to host round trips through a real bridge directory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::capture::CaptureStore;
use crate::debug::NoSessions;
use crate::transport::client::pending_jobs;
use crate::{BridgeClient, BridgeConfig, BridgeContext, BridgeHost, Dispatcher, Envelope, HostConfig, Registry};

struct Harness {
    workspace: tempfile::TempDir,
    client: BridgeClient,
    capture: Arc<CaptureStore>,
    shutdown: CancellationToken,
    host: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        let workspace = tempfile::tempdir().expect("tempdir");
        let capture = Arc::new(CaptureStore::new());
        let bridge = BridgeContext::new(workspace.path(), Arc::new(NoSessions), capture.clone());
        let dispatcher = Dispatcher::new(Arc::new(Registry::with_builtin_scripts()), Arc::new(bridge));

        let mut config = HostConfig::new(workspace.path());
        config.scan_interval = Duration::from_millis(10);
        config.cancel_poll_interval = Duration::from_millis(10);
        let mut host = BridgeHost::start(config, Arc::new(dispatcher)).await.expect("host start");

        let mut client_config = BridgeConfig::new(host.bridge_root(), Duration::from_secs(10));
        client_config.poll_interval = Duration::from_millis(10);
        let client = BridgeClient::new(client_config);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let host = tokio::spawn(async move {
            host.run(stop).await.expect("host run");
        });

        Self {
            workspace,
            client,
            capture,
            shutdown,
            host,
        }
    }

    async fn run(&self, script: &str, params: Value) -> Envelope {
        self.client.run(script, params).await
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.host.await.expect("host task");
    }
}

#[tokio::test]
async fn test_breakpoint_set_round_trip() {
    let harness = Harness::start().await;
    let file = harness.workspace.path().join("x.js");
    std::fs::write(&file, "a\nb\nc\nd\ne\nf\n").expect("write source");
    let path = file.to_string_lossy().to_string();

    let envelope = harness.run("breakpoint.set", json!({"path": path, "line": 5})).await;
    assert!(envelope.ok, "unexpected envelope: {envelope:?}");
    let bp = &envelope.data.as_ref().expect("data")["breakpoint"];
    assert_eq!(bp["path"], json!(path));
    assert_eq!(bp["line"], json!(5));
    assert_eq!(bp["enabled"], json!(true));
    assert_eq!(bp["verified"], json!(true));
    assert_eq!(envelope.meta.as_ref().map(|m| m.script_name.as_deref()), Some(Some("breakpoint.set")));

    let envelope = harness.run("breakpoint.set", json!({"path": path, "line": 0})).await;
    assert!(!envelope.ok);
    assert_eq!(envelope.error_code(), Some("E_INVALID_LINE"));

    harness.stop().await;
}

#[tokio::test]
async fn test_wait_without_session_times_out_and_cleans_up() {
    let harness = Harness::start().await;
    let started = Instant::now();
    let envelope = harness.run("debug.wait-for-hit", json!({"timeoutMs": 1000})).await;
    let elapsed = started.elapsed();

    assert_eq!(envelope.error_code(), Some("E_TIMEOUT"));
    assert!(elapsed >= Duration::from_millis(1000), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "took too long: {elapsed:?}");
    let root = harness.client.bridge_root().expect("root");
    assert_eq!(pending_jobs(&root).await, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_compare_counts_between_captured_sessions() {
    let harness = Harness::start().await;
    let output = |category: &str, text: &str| {
        json!({"type": "event", "event": "output", "body": {"category": category, "output": text}})
    };
    harness.capture.start_session_at("A", "node", "first", None, 1_000).await;
    harness.capture.record_message_at("A", &output("stdout", "start"), 1_010).await;
    harness.capture.start_session_at("B", "node", "second", None, 2_000).await;
    harness.capture.record_message_at("B", &output("stdout", "start"), 2_010).await;
    harness.capture.record_message_at("B", &output("stderr", "boom"), 2_020).await;

    let envelope = harness
        .run("dap.compare", json!({"sessionA": "A", "sessionB": "B", "compareBy": "counts"}))
        .await;
    assert!(envelope.ok, "unexpected envelope: {envelope:?}");
    let data = envelope.data.expect("data");
    assert_eq!(data["comparison"]["counts"]["deltaOutputs"], json!(-1));

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_script_and_concurrent_jobs() {
    let harness = Harness::start().await;
    let (missing, list, bps) = tokio::join!(
        harness.run("no.such.script", json!({})),
        harness.run("script.list", json!({})),
        harness.run("breakpoint.list", json!({})),
    );
    assert_eq!(missing.error_code(), Some("E_SCRIPT_NOT_FOUND"));
    assert!(list.ok, "unexpected envelope: {list:?}");
    assert_eq!(bps.data.expect("data")["total"], json!(0));

    harness.stop().await;
}
