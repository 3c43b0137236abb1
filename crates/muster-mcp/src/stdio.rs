//! Stdio transport: runs an MCP server as a subprocess and exchanges
//! newline-delimited JSON-RPC 2.0 messages over its stdin/stdout.

use crate::protocol::*;
use crate::provider::{LaunchDescriptor, ProviderLauncher, ToolProvider};
use async_trait::async_trait;
use muster_core::{MusterError, MusterResult};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound for a single JSON-RPC round trip.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a server gets to exit after stdin is closed before it is killed.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes of stderr kept for failure diagnostics.
const STDERR_TAIL_LIMIT: usize = 2000;

/// How long a transport failure waits for the stderr pump to reach EOF.
const STDERR_SETTLE: Duration = Duration::from_millis(250);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// An MCP server subprocess speaking JSON-RPC over stdio.
pub struct StdioProvider {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    stdout_eof: Arc<AtomicBool>,
    next_id: AtomicU64,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stderr_tail: Arc<parking_lot::Mutex<String>>,
    stderr_done: watch::Receiver<bool>,
    closed: AtomicBool,
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl StdioProvider {
    /// Spawn the server process and start the stdout/stderr pumps.
    ///
    /// No message is exchanged yet; call [`ToolProvider::handshake`].
    pub fn spawn(
        name: &str,
        launch: &LaunchDescriptor,
        request_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> MusterResult<Self> {
        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &launch.cwd {
            cmd.current_dir(dir);
        }

        let launch_error = |reason: String| MusterError::Launch {
            provider: name.to_string(),
            reason,
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_error(format!("failed to spawn '{}': {e}", launch.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("stdout not available".into()))?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stdout_eof = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(parking_lot::Mutex::new(String::new()));
        let (stderr_done_tx, stderr_done) = watch::channel(stderr.is_none());

        let mut tasks = vec![tokio::spawn(read_responses(
            name.to_string(),
            stdout,
            pending.clone(),
            stdout_eof.clone(),
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(
                name.to_string(),
                stderr,
                stderr_tail.clone(),
                stderr_done_tx,
            )));
        }

        debug!(server = %name, command = %launch.command, pid = ?child.id(), "MCP server spawned");

        Ok(Self {
            name: name.to_string(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            stdout_eof,
            next_id: AtomicU64::new(1),
            tasks: parking_lot::Mutex::new(tasks),
            stderr_tail,
            stderr_done,
            closed: AtomicBool::new(false),
            request_timeout,
            shutdown_timeout,
        })
    }

    fn transport(&self, reason: impl Into<String>) -> MusterError {
        MusterError::Transport {
            provider: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn protocol(&self, reason: impl Into<String>) -> MusterError {
        MusterError::Protocol {
            provider: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Appends captured stderr to transport and protocol failures.
    ///
    /// A transport failure usually means the process died, so its last
    /// stderr lines may still be in flight.
    async fn with_stderr(&self, err: MusterError) -> MusterError {
        if matches!(err, MusterError::Transport { .. }) {
            let mut done = self.stderr_done.clone();
            let _ = tokio::time::timeout(STDERR_SETTLE, done.wait_for(|d| *d)).await;
        }
        let tail = self.stderr_tail.lock().trim().to_string();
        if tail.is_empty() {
            return err;
        }
        match err {
            MusterError::Transport { provider, reason } => MusterError::Transport {
                provider,
                reason: format!("{reason} | stderr: {tail}"),
            },
            MusterError::Protocol { provider, reason } => MusterError::Protocol {
                provider,
                reason: format!("{reason} | stderr: {tail}"),
            },
            other => other,
        }
    }

    async fn write_line(&self, msg: &str) -> MusterResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| self.transport("stdin already closed"))?;
        stdin
            .write_all(msg.as_bytes())
            .await
            .map_err(|e| self.transport(format!("failed to write to stdin: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| self.transport(format!("failed to write newline: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.transport(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// Send a JSON-RPC request and wait for its result.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> MusterResult<serde_json::Value> {
        if self.is_closed() {
            return Err(self.transport(format!("request '{method}' on a closed provider")));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let msg = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.stdout_eof.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(self.transport("server closed stdout"));
        }

        if let Err(e) = self.write_line(&msg).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let resp = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(self.transport(format!(
                    "server closed stdout before answering '{method}'"
                )))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(MusterError::HandshakeTimeout {
                    provider: self.name.clone(),
                    timeout: self.request_timeout,
                });
            }
        };

        if let Some(err) = resp.error {
            return Err(self.protocol(format!(
                "'{method}' rejected with {}: {}",
                err.code, err.message
            )));
        }

        resp.result
            .ok_or_else(|| self.protocol(format!("empty '{method}' result")))
    }

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> MusterResult<()> {
        let msg = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_line(&msg).await
    }

    async fn negotiate(&self) -> MusterResult<InitializeResult> {
        let result = self.request("initialize", Some(initialize_params())).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| self.protocol(format!("failed to parse initialize result: {e}")))?;
        init.check_compatible().map_err(|reason| self.protocol(reason))?;

        self.notify("notifications/initialized", None).await?;

        info!(
            server = %self.name,
            version = %init.protocol_version,
            "MCP server initialized"
        );
        Ok(init)
    }
}

#[async_trait]
impl ToolProvider for StdioProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handshake(&self) -> MusterResult<InitializeResult> {
        match self.negotiate().await {
            Ok(init) => Ok(init),
            Err(e) => Err(self.with_stderr(e).await),
        }
    }

    async fn list_tools(&self) -> MusterResult<Vec<McpToolDef>> {
        let result = match self.request("tools/list", None).await {
            Ok(result) => result,
            Err(e) => return Err(self.with_stderr(e).await),
        };
        let tools = parse_tool_list(result).map_err(|reason| self.protocol(reason))?;
        info!(server = %self.name, tools = tools.len(), "MCP tools discovered");
        Ok(tools)
    }

    async fn close(&self) -> MusterResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // EOF on stdin is the stdio shutdown signal.
        drop(self.stdin.lock().await.take());

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.name, %status, "MCP server exited"),
                Ok(Err(e)) => warn!(server = %self.name, error = %e, "Failed to reap MCP server"),
                Err(_) => {
                    warn!(
                        server = %self.name,
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "MCP server did not exit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(server = %self.name, error = %e, "Failed to kill MCP server");
                    }
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending.lock().await.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn read_responses(
    name: String,
    stdout: ChildStdout,
    pending: PendingMap,
    stdout_eof: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(server = %name, "MCP server stdout closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    // Server-initiated requests and notifications carry a method.
                    Ok(resp) if resp.method.is_some() => {
                        debug!(server = %name, method = ?resp.method, "Ignoring server message");
                    }
                    Ok(resp) => {
                        if let Some(id) = resp.id {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(resp);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(server = %name, line = %trimmed, error = %e, "Non-JSON-RPC line from MCP server");
                    }
                }
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Error reading MCP server stdout");
                break;
            }
        }
    }

    // Dropping the senders wakes every waiter with an error.
    stdout_eof.store(true, Ordering::SeqCst);
    pending.lock().await.clear();
}

async fn drain_stderr(
    name: String,
    stderr: ChildStderr,
    tail: Arc<parking_lot::Mutex<String>>,
    done: watch::Sender<bool>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %name, stderr = %line, "MCP server stderr");
        let mut buf = tail.lock();
        buf.push_str(&line);
        buf.push('\n');
        truncate_front(&mut buf, STDERR_TAIL_LIMIT);
    }
    done.send_replace(true);
}

/// Keeps at most `limit` trailing bytes, cutting on a char boundary.
fn truncate_front(buf: &mut String, limit: usize) {
    if buf.len() <= limit {
        return;
    }
    let start = buf.len() - limit;
    let cut = (start..buf.len())
        .find(|i| buf.is_char_boundary(*i))
        .unwrap_or(buf.len());
    buf.drain(..cut);
}

/// Launches [`StdioProvider`]s.
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl StdioLauncher {
    /// A launcher with the default request and shutdown bounds.
    pub fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Overrides the bound on a single JSON-RPC round trip.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the grace period given to a server on close.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Bound applied to each JSON-RPC round trip.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl Default for StdioLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderLauncher for StdioLauncher {
    async fn launch(
        &self,
        name: &str,
        launch: &LaunchDescriptor,
    ) -> MusterResult<Arc<dyn ToolProvider>> {
        let provider =
            StdioProvider::spawn(name, launch, self.request_timeout, self.shutdown_timeout)?;
        Ok(Arc::new(provider))
    }
}
