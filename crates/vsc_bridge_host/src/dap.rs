//! A debug adapter driven over stdio with Content-Length framing.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use vsc_bridge_core::breakpoints::{sync_file, BreakpointStore};
use vsc_bridge_core::debug::DebugSession;
use vsc_bridge_core::{CaptureStore, DapError};

const INITIALIZED_EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Identity of a session plus its per-request timeout.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub id: String,
    pub session_type: String,
    pub name: String,
    pub request_timeout: Duration,
}

struct Initialized {
    seen: AtomicBool,
    notify: Notify,
}

pub struct DapSession {
    spec: SessionSpec,
    writer: Mutex<Writer>,
    pending: Pending,
    next_seq: AtomicU64,
    initialized: Arc<Initialized>,
    closed: Arc<AtomicBool>,
    /// Set once the adapter reports `terminated`.
    terminated: Arc<AtomicBool>,
    kill: CancellationToken,
    reader_task: JoinHandle<()>,
}

impl DapSession {
    /// Start the adapter process and attach a session to its stdio.
    pub async fn spawn(
        adapter: &str,
        args: &[String],
        spec: SessionSpec,
        capture: Arc<CaptureStore>,
    ) -> Result<Arc<Self>, DapError> {
        let mut child = Command::new(adapter)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DapError::Transport(format!("Failed to spawn adapter '{adapter}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DapError::Transport("Adapter spawn failed: missing stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DapError::Transport("Adapter spawn failed: missing stdout pipe".into()))?;

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(DapError::Transport(format!(
                    "Adapter exited during startup with status: {status}"
                )))
            }
            Ok(None) => tracing::debug!("Adapter process running: adapter={}", adapter),
            Err(e) => {
                return Err(DapError::Transport(format!(
                    "Failed while probing adapter startup state: {e}"
                )))
            }
        }

        let session_id = spec.id.clone();
        let session = Self::connect(stdout, Box::new(stdin), spec, Arc::clone(&capture));
        tokio::spawn(monitor_exit(child, session_id, capture, session.kill.clone()));
        Ok(session)
    }

    /// Attach a session to an already connected adapter stream.
    pub fn connect<R>(reader: R, writer: Writer, spec: SessionSpec, capture: Arc<CaptureStore>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let initialized = Arc::new(Initialized {
            seen: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let closed = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(reader_loop(
            BufReader::new(reader),
            spec.id.clone(),
            pending.clone(),
            capture,
            initialized.clone(),
            SessionFlags {
                closed: closed.clone(),
                terminated: terminated.clone(),
            },
        ));

        Arc::new(Self {
            spec,
            writer: Mutex::new(writer),
            pending,
            next_seq: AtomicU64::new(0),
            initialized,
            closed,
            terminated,
            kill: CancellationToken::new(),
            reader_task,
        })
    }

    async fn send_request_begin(
        &self,
        command: &str,
        arguments: Value,
    ) -> Result<(u64, oneshot::Receiver<Value>), DapError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DapError::Closed);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        let framed = encode_message(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(&framed).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&seq);
            return Err(DapError::Transport(format!(
                "Failed to send DAP request '{command}' to adapter: {e}"
            )));
        }
        tracing::debug!("DAP request sent: session={}, command={}, seq={}", self.spec.id, command, seq);
        Ok((seq, rx))
    }

    /// Resolve with the response body, or the adapter's failure message.
    async fn await_response(
        &self,
        command: &str,
        seq: u64,
        rx: oneshot::Receiver<Value>,
        wait_timeout: Duration,
    ) -> Result<Value, DapError> {
        let response = match timeout(wait_timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => return Err(DapError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                return Err(DapError::Timeout {
                    command: command.to_string(),
                });
            }
        };

        let success = response.get("success").and_then(Value::as_bool).unwrap_or(true);
        if !success {
            let message = response
                .get("body")
                .and_then(|b| b.get("error"))
                .and_then(|e| e.get("format"))
                .or_else(|| response.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown adapter error");
            return Err(DapError::request(command, message));
        }
        Ok(response.get("body").cloned().unwrap_or_else(|| json!({})))
    }

    async fn wait_for_initialized(&self, wait_timeout: Duration) -> bool {
        let notified = self.initialized.notify.notified();
        if self.initialized.seen.load(Ordering::SeqCst) {
            return true;
        }
        let _ = timeout(wait_timeout, notified).await;
        self.initialized.seen.load(Ordering::SeqCst)
    }

    /// initialize, launch/attach, initialized, setBreakpoints, configurationDone.
    /// Returns the adapter's capabilities.
    pub async fn start(
        &self,
        request: &str,
        configuration: Value,
        breakpoints: &BreakpointStore,
    ) -> Result<Value, DapError> {
        let capabilities = self
            .request("initialize", initialize_args(&self.spec.session_type))
            .await?;

        // Adapters answer launch/attach only after configurationDone.
        let (seq, rx) = self.send_request_begin(request, configuration).await?;

        if !self.wait_for_initialized(INITIALIZED_EVENT_WAIT_TIMEOUT).await {
            tracing::warn!("No initialized event before configurationDone: session={}", self.spec.id);
        }
        for path in breakpoints.files().await {
            let file_breakpoints = breakpoints.for_file(&path).await;
            if let Err(e) = sync_file(self, &path, &file_breakpoints).await {
                tracing::warn!("Initial breakpoints rejected: session={}, path={}, error={}", self.spec.id, path, e);
            }
        }
        self.request("configurationDone", json!({})).await?;

        self.await_response(request, seq, rx, self.spec.request_timeout).await?;
        tracing::info!("Debug session started: id={}, type={}", self.spec.id, self.spec.session_type);
        Ok(capabilities)
    }

    /// The debuggee terminated or the adapter stream is gone.
    pub fn is_ended(&self) -> bool {
        self.terminated.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst)
    }

    /// Stop reading and terminate the adapter process.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.kill.cancel();
        self.reader_task.abort();
    }
}

impl Drop for DapSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl DebugSession for DapSession {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn session_type(&self) -> &str {
        &self.spec.session_type
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn request(&self, command: &str, args: Value) -> Result<Value, DapError> {
        let (seq, rx) = self.send_request_begin(command, args).await?;
        self.await_response(command, seq, rx, self.spec.request_timeout).await
    }
}

fn initialize_args(adapter_id: &str) -> Value {
    json!({
        "adapterID": adapter_id,
        "clientID": "vsc_bridge_host",
        "clientName": "vsc_bridge_host",
        "locale": "en-US",
        "pathFormat": "path",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "supportsVariableType": true,
        "supportsVariablePaging": true,
        "supportsRunInTerminalRequest": false,
    })
}

async fn monitor_exit(mut child: Child, session_id: String, capture: Arc<CaptureStore>, kill: CancellationToken) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill adapter: session={}, error={}", session_id, e);
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code().map(i64::from),
        Err(e) => {
            tracing::warn!("Failed to reap adapter: session={}, error={}", session_id, e);
            None
        }
    };
    tracing::info!("Adapter exited: session={}, code={:?}", session_id, code);
    capture.record_adapter_exit(&session_id, code).await;
}

struct SessionFlags {
    closed: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

async fn reader_loop<R>(
    mut reader: R,
    session_id: String,
    pending: Pending,
    capture: Arc<CaptureStore>,
    initialized: Arc<Initialized>,
    flags: SessionFlags,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let message = match read_dap_message(&mut reader).await {
            Ok(message) => message,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    tracing::warn!("Adapter stream failed: session={}, error={}", session_id, e);
                    capture.record_adapter_error(&session_id, &e.to_string()).await;
                }
                break;
            }
        };

        match message.get("type").and_then(Value::as_str) {
            Some("response") => {
                if let Some(request_seq) = message.get("request_seq").and_then(Value::as_u64) {
                    if let Some(tx) = pending.lock().await.remove(&request_seq) {
                        let _ = tx.send(message);
                    }
                }
            }
            Some("event") => {
                match message.get("event").and_then(Value::as_str) {
                    Some("initialized") => {
                        initialized.seen.store(true, Ordering::SeqCst);
                        initialized.notify.notify_waiters();
                    }
                    Some("terminated") => flags.terminated.store(true, Ordering::SeqCst),
                    _ => {}
                }
                capture.record_message(&session_id, &message).await;
            }
            Some("request") => {
                let command = message.get("command").and_then(Value::as_str).unwrap_or_default();
                tracing::debug!("Ignoring reverse request: session={}, command={}", session_id, command);
            }
            _ => {}
        }
    }

    flags.closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every outstanding request with Closed.
    pending.lock().await.clear();
}

fn encode_message(message: &Value) -> Result<Vec<u8>, DapError> {
    let body = serde_json::to_vec(message)
        .map_err(|e| DapError::Transport(format!("Failed to encode DAP message: {e}")))?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(&body);
    Ok(framed)
}

async fn read_dap_message<R>(reader: &mut R) -> std::io::Result<Value>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "adapter stdout closed while reading DAP headers",
            ));
        }

        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<usize>().map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid Content-Length value: {e}"),
                    )
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing required Content-Length header",
        )
    })?;

    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice::<Value>(&body).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid DAP JSON payload: {e}"),
        )
    })
}
