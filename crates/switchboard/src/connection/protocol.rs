//! Tool-server wire protocol: newline-delimited JSON-RPC 2.0 over the child
//! process's stdin/stdout.
//!
//! The [`ToolChannel`] trait is the seam between the connection manager and
//! the transport. [`StdioChannel`] is the production implementation: a
//! background reader task routes responses to pending requests by id, answers
//! server `ping`s, and fails every pending request with a connection-loss
//! error when stdout closes. Lines that are not UTF-8 or not JSON-RPC are
//! skipped; only end of output or a read error ends the channel.
//!
//! The three protocol operations the manager needs sit on top of any channel:
//! [`initialize`], [`list_tools`] and [`call_tool`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::script::ScriptTarget;
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ProtocolError};

/// Protocol revision requested during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on `tools/list` pages followed for one catalogue.
const MAX_CATALOGUE_PAGES: usize = 64;

/// How long a closing server gets to exit after stdin is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Boxed future returned by [`ToolChannel`] methods.
pub type ProtocolFuture<'a, T> = BoxFuture<'a, Result<T, ProtocolError>>;

// ── Catalogue types ────────────────────────────────────────────────

/// One tool advertised by the tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Identity reported by the server in its `initialize` result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    #[serde(default)]
    protocol_version: String,
    #[serde(default)]
    server_info: Option<RawServerInfo>,
}

#[derive(Deserialize, Default)]
struct RawServerInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsPage {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default)]
    next_cursor: Option<String>,
}

// ── Channel and launcher seams ────────────────────────────────────

/// A request/response channel to one tool server.
pub trait ToolChannel: Send + Sync {
    /// Send a request and wait for its response's `result`.
    fn request(&self, method: &str, params: Option<Value>) -> ProtocolFuture<'_, Value>;

    /// Send a notification (no response expected).
    fn notify(&self, method: &str, params: Option<Value>) -> ProtocolFuture<'_, ()>;

    /// Close the channel and stop the server.
    fn close(&self) -> ProtocolFuture<'_, ()>;

    /// Resolves once the channel is closed, either because the server went
    /// away or because `close` was called. Does not borrow the channel.
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// Starts tool servers. The manager only sees channels, never processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, target: &ScriptTarget) -> Result<Arc<dyn ToolChannel>, ConnectionError>;
}

/// Launches the script as a child process and talks to it over stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, target: &ScriptTarget) -> Result<Arc<dyn ToolChannel>, ConnectionError> {
        Ok(Arc::new(StdioChannel::spawn(target)?))
    }
}

// ── Frames ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct ReplyFrame {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct IncomingFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Serialize, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// ── StdioChannel ──────────────────────────────────────────────────

type Waiter = oneshot::Sender<Result<Value, ProtocolError>>;
type SharedWriter = Arc<tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

type SharedPending = Arc<Mutex<Pending>>;
type ClosedSignal = Arc<watch::Sender<bool>>;

fn lock_pending(pending: &SharedPending) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// JSON-RPC channel over a pair of byte streams, normally a child's stdio.
pub struct StdioChannel {
    writer: SharedWriter,
    pending: SharedPending,
    next_id: AtomicU64,
    closed: ClosedSignal,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioChannel {
    /// Spawn the script's interpreter and attach to its stdio.
    pub fn spawn(target: &ScriptTarget) -> Result<Self, ConnectionError> {
        let spawn_error = |source: std::io::Error| ConnectionError::Spawn {
            interpreter: target.kind().interpreter(),
            path: target.path().to_path_buf(),
            source,
        };

        let mut child = target.command().spawn().map_err(spawn_error)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(spawn_error(std::io::Error::other("child stdio was not piped")));
        };
        debug!(
            "Spawned {} tool server {} (pid {:?})",
            target.kind(),
            target.path().display(),
            child.id()
        );

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(forward_stderr(stderr)));
        let channel = Self::assemble(stdout, stdin, Some(child));
        if let Some(task) = stderr_task {
            channel
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(task);
        }
        Ok(channel)
    }

    /// Build a channel over arbitrary streams. Must be called inside a
    /// Tokio runtime: it spawns the reader task.
    pub fn from_stdio(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::assemble(reader, writer, None)
    }

    fn assemble(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        child: Option<Child>,
    ) -> Self {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(Box::new(writer))));
        let pending = SharedPending::default();
        let closed: ClosedSignal = Arc::new(watch::channel(false).0);
        let reader_task = tokio::spawn(read_loop(
            BufReader::new(reader),
            Arc::clone(&pending),
            Arc::clone(&writer),
            Arc::clone(&closed),
        ));
        Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            child: tokio::sync::Mutex::new(child),
            tasks: Mutex::new(vec![reader_task]),
        }
    }
}

impl ToolChannel for StdioChannel {
    fn request(&self, method: &str, params: Option<Value>) -> ProtocolFuture<'_, Value> {
        let method = method.to_string();
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = lock_pending(&self.pending);
                if pending.closed {
                    return Err(ProtocolError::Closed);
                }
                pending.waiters.insert(id, tx);
            }
            let _guard = WaiterGuard {
                pending: &self.pending,
                id,
            };

            trace!("tool server -> {method} (id {id})");
            let frame = OutgoingFrame {
                jsonrpc: "2.0",
                id: Some(id),
                method: &method,
                params: params.as_ref(),
            };
            write_frame(&self.writer, &frame).await?;

            rx.await.unwrap_or(Err(ProtocolError::Closed))
        })
    }

    fn notify(&self, method: &str, params: Option<Value>) -> ProtocolFuture<'_, ()> {
        let method = method.to_string();
        Box::pin(async move {
            trace!("tool server -> {method} (notification)");
            let frame = OutgoingFrame {
                jsonrpc: "2.0",
                id: None,
                method: &method,
                params: params.as_ref(),
            };
            write_frame(&self.writer, &frame).await
        })
    }

    fn close(&self) -> ProtocolFuture<'_, ()> {
        Box::pin(async move {
            // Dropping stdin is the server's cue to exit.
            self.writer.lock().await.take();
            fail_pending(&self.pending, &ProtocolError::Closed);
            self.closed.send_replace(true);

            let child = self.child.lock().await.take();
            let result = match child {
                Some(mut child) => match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!("Tool server exited with {status}");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(ProtocolError::Io(e)),
                    Err(_) => {
                        warn!("Tool server did not exit within {CLOSE_GRACE:?}; killing it");
                        child.kill().await.map_err(ProtocolError::Io)
                    }
                },
                None => Ok(()),
            };

            for task in self
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
            {
                task.abort();
            }
            result
        })
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut closed = self.closed.subscribe();
        Box::pin(async move {
            // A dropped sender means the channel itself is gone.
            let _ = closed.wait_for(|closed| *closed).await;
        })
    }
}

impl Drop for StdioChannel {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Removes a request's waiter if the request future is dropped early.
struct WaiterGuard<'a> {
    pending: &'a SharedPending,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).waiters.remove(&self.id);
    }
}

async fn write_frame<T: Serialize>(writer: &SharedWriter, frame: &T) -> Result<(), ProtocolError> {
    let mut bytes = serde_json::to_vec(frame)
        .map_err(|e| ProtocolError::Malformed(format!("failed to encode frame: {e}")))?;
    bytes.push(b'\n');

    let mut guard = writer.lock().await;
    let stream = guard.as_mut().ok_or(ProtocolError::Closed)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: BufReader<R>,
    pending: SharedPending,
    writer: SharedWriter,
    closed: ClosedSignal,
) {
    let mut buf = Vec::new();
    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break ProtocolError::Closed,
            Ok(_) => {
                let Ok(line) = std::str::from_utf8(&buf) else {
                    warn!("Ignoring non-UTF-8 line from tool server ({} bytes)", buf.len());
                    continue;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                trace!("tool server <- {line}");
                match serde_json::from_str::<IncomingFrame>(line) {
                    Ok(frame) => route_frame(frame, &pending, &writer).await,
                    Err(e) => warn!("Ignoring non-JSON-RPC line from tool server: {e}"),
                }
            }
            Err(e) => break ProtocolError::Io(e),
        }
    };
    debug!("Tool server output ended: {reason}");
    fail_pending(&pending, &reason);
    closed.send_replace(true);
}

async fn route_frame(frame: IncomingFrame, pending: &SharedPending, writer: &SharedWriter) {
    match (frame.id, frame.method) {
        // Server-initiated request.
        (Some(id), Some(method)) => {
            let reply = if method == "ping" {
                ReplyFrame {
                    jsonrpc: "2.0",
                    id,
                    result: Some(json!({})),
                    error: None,
                }
            } else {
                debug!("Rejecting unsupported server request '{method}'");
                ReplyFrame {
                    jsonrpc: "2.0",
                    id,
                    result: None,
                    error: Some(RpcErrorObject {
                        code: -32601,
                        message: format!("method '{method}' is not supported by this client"),
                        data: None,
                    }),
                }
            };
            if let Err(e) = write_frame(writer, &reply).await {
                warn!("Failed to answer server request '{method}': {e}");
            }
        }
        (Some(id), None) => {
            let Some(id) = id.as_u64() else {
                warn!("Ignoring response with non-numeric id {id}");
                return;
            };
            let waiter = lock_pending(pending).waiters.remove(&id);
            let Some(waiter) = waiter else {
                debug!("Dropping response for unknown request id {id}");
                return;
            };
            let outcome = match frame.error {
                Some(err) => Err(ProtocolError::Rpc {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                }),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            // The requester may have given up; nothing to do then.
            let _ = waiter.send(outcome);
        }
        (None, Some(method)) => debug!("Tool server notification: {method}"),
        (None, None) => debug!("Ignoring tool server frame with neither id nor method"),
    }
}

/// Mark the channel closed and fail every waiting request with `reason`.
fn fail_pending(pending: &SharedPending, reason: &ProtocolError) {
    let waiters = {
        let mut guard = lock_pending(pending);
        guard.closed = true;
        std::mem::take(&mut guard.waiters)
    };
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(loss_like(reason)));
    }
}

/// Per-waiter copy of a loss reason (`io::Error` is not `Clone`).
fn loss_like(reason: &ProtocolError) -> ProtocolError {
    match reason {
        ProtocolError::Io(e) => ProtocolError::Io(std::io::Error::new(e.kind(), e.to_string())),
        ProtocolError::Malformed(m) => ProtocolError::Malformed(m.clone()),
        _ => ProtocolError::Closed,
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("tool server stderr: {line}");
    }
}

// ── Protocol operations ───────────────────────────────────────────

/// Perform the `initialize` handshake and send `notifications/initialized`.
pub async fn initialize(
    channel: &dyn ToolChannel,
    config: &ConnectionConfig,
) -> Result<ServerInfo, ProtocolError> {
    let params = json!({
        "protocolVersion": config.protocol_version,
        "capabilities": {},
        "clientInfo": {
            "name": config.client_name,
            "version": config.client_version,
        },
    });
    let raw = channel.request("initialize", Some(params)).await?;
    let result: InitializeResult = serde_json::from_value(raw)
        .map_err(|e| ProtocolError::Malformed(format!("invalid initialize result: {e}")))?;

    channel.notify("notifications/initialized", None).await?;

    let server = result.server_info.unwrap_or_default();
    Ok(ServerInfo {
        name: server.name,
        version: server.version,
        protocol_version: result.protocol_version,
    })
}

/// Fetch the full tool catalogue, following `nextCursor` pagination.
///
/// Duplicate names keep their first descriptor.
pub async fn list_tools(channel: &dyn ToolChannel) -> Result<Vec<ToolDescriptor>, ProtocolError> {
    let mut tools: Vec<ToolDescriptor> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_CATALOGUE_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let raw = channel.request("tools/list", params).await?;
        let page: ListToolsPage = serde_json::from_value(raw)
            .map_err(|e| ProtocolError::Malformed(format!("invalid tools/list result: {e}")))?;

        for tool in page.tools {
            if seen.insert(tool.name.clone()) {
                tools.push(tool);
            } else {
                warn!("Tool server listed '{}' more than once; keeping the first", tool.name);
            }
        }

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    Err(ProtocolError::Malformed(format!(
        "tools/list did not finish within {MAX_CATALOGUE_PAGES} pages"
    )))
}

/// Invoke a tool. The server's result object is returned unmodified,
/// including tool-level failures flagged with `isError`.
pub async fn call_tool(
    channel: &dyn ToolChannel,
    name: &str,
    arguments: Value,
) -> Result<Value, ProtocolError> {
    let params = json!({ "name": name, "arguments": arguments });
    channel.request("tools/call", Some(params)).await
}
