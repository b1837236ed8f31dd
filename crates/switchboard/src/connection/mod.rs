//! Tool-server connection lifecycle.
//!
//! [`ToolConnectionManager`] owns the single connection to a subprocess tool
//! server: its [`ConnectionState`], its tool catalogue, and the listeners
//! observing state changes. It is the only path for invoking subprocess tools.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected
//!      ▲                        │                           │
//!      └──── handshake failed ──┘                 I/O or protocol error
//!                                                           ▼
//!                    Connecting ◀──────── reconnect ─────── Lost
//! ```
//!
//! `disconnect` moves any state to `Disconnected`. Only `Connected` accepts
//! tool calls.
//!
//! # Concurrency
//!
//! State lives behind a mutex that is never held across an `.await`. Each
//! connection gets a generation number, so late results from an old
//! connection (a handshake finishing after `disconnect`, a loss reported by a
//! call that started before a reconnect) cannot clobber newer state.
//! Listener notifications are delivered in transition order.
//!
//! Every session has a watcher task waiting on [`ToolChannel::closed`], so a
//! server that exits while no call is running still moves the manager to
//! `Lost`.
//!
//! Listener callbacks run synchronously on the thread performing the
//! transition. They may read manager state, but must not call `connect` or
//! `disconnect` directly; spawn a task for that (see [`supervisor`]).

mod listeners;
pub mod protocol;
pub mod script;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ProtocolError};
use crate::tools::{log_tool_call, validate_arguments};

pub use listeners::{ConnectionCallback, ConnectionSubscription};
pub use protocol::{
    Launcher, ProcessLauncher, ServerInfo, StdioChannel, ToolChannel, ToolDescriptor,
};
pub use script::{ScriptKind, ScriptTarget};
pub use supervisor::{SupervisorExit, spawn_reconnect_supervisor};

use listeners::ListenerRegistry;

/// Connection state of the tool server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The connection failed mid-session. Refuses calls like
    /// `Disconnected`, but is eligible for automatic reconnection.
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Lost => write!(f, "lost"),
        }
    }
}

/// One live connection: the channel plus the catalogue fetched for it.
struct Session {
    generation: u64,
    channel: Arc<dyn ToolChannel>,
    server: ServerInfo,
    tools: Vec<ToolDescriptor>,
}

impl Session {
    fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    generation: u64,
    session: Option<Arc<Session>>,
    target: Option<ScriptTarget>,
}

/// State reachable from both the manager and its session watchers.
#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    listeners: Arc<ListenerRegistry>,
    /// Serializes notification delivery so listeners see transitions in order.
    delivery: Mutex<()>,
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a state change, then deliver its notification (if any) before
    /// any later transition can deliver its own.
    fn transition<T>(&self, apply: impl FnOnce(&mut Inner) -> (Option<bool>, T)) -> T {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        let (notify, out) = {
            let mut inner = self.lock_inner();
            apply(&mut inner)
        };
        if let Some(connected) = notify {
            let delivered = self.listeners.notify(connected);
            trace!("Delivered connected={connected} to {delivered} listener(s)");
        }
        out
    }

    /// Move `Connected` → `Lost` for `generation`. Only the first reporter
    /// of a given loss transitions and notifies.
    async fn mark_lost(&self, generation: u64, cause: &ProtocolError) {
        let lost = self.transition(|inner| {
            if inner.generation == generation && inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Lost;
                (Some(false), inner.session.take())
            } else {
                (None, None)
            }
        });
        if let Some(session) = lost {
            warn!("Tool server connection lost: {cause}");
            if let Err(e) = session.channel.close().await {
                debug!("Closing lost tool server connection failed: {e}");
            }
        }
    }
}

/// Owner of the tool-server connection. Share it behind an `Arc`.
pub struct ToolConnectionManager {
    launcher: Arc<dyn Launcher>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
}

impl fmt::Debug for ToolConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("ToolConnectionManager")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("target", &inner.target)
            .field("listeners", &self.shared.listeners.len())
            .finish()
    }
}

impl ToolConnectionManager {
    /// Manager that launches tool servers as child processes.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_launcher(Arc::new(ProcessLauncher), config)
    }

    pub fn with_launcher(launcher: Arc<dyn Launcher>, config: ConnectionConfig) -> Self {
        Self {
            launcher,
            config,
            shared: Arc::default(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock_inner()
    }

    fn transition<T>(&self, apply: impl FnOnce(&mut Inner) -> (Option<bool>, T)) -> T {
        self.shared.transition(apply)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The current catalogue. Empty unless connected.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.lock_inner()
            .session
            .as_ref()
            .map(|s| s.tools.clone())
            .unwrap_or_default()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.lock_inner()
            .session
            .as_ref()
            .map(|s| s.tool_names())
            .unwrap_or_default()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.lock_inner().session.as_ref().map(|s| s.server.clone())
    }

    /// Script of the current or most recent connection attempt.
    pub fn target(&self) -> Option<ScriptTarget> {
        self.lock_inner().target.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    // ── Listeners ──────────────────────────────────────────────────

    /// Observe connection changes: `true` on connect, `false` when a
    /// connection fails, is lost, or is closed.
    pub fn on_connection_change(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> ConnectionSubscription {
        self.shared.listeners.subscribe(callback)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Start the tool server at `path`, perform the handshake, and load its
    /// catalogue.
    ///
    /// The script kind is checked before anything is spawned. Allowed from
    /// `Disconnected` and `Lost`; a second call while `Connecting` fails with
    /// [`ConnectionError::ConnectInProgress`], and a call while `Connected`
    /// with [`ConnectionError::AlreadyConnected`].
    pub async fn connect(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Vec<ToolDescriptor>, ConnectionError> {
        let target = ScriptTarget::new(path.as_ref())?;

        let generation = {
            let mut inner = self.lock_inner();
            match inner.state {
                ConnectionState::Connecting => return Err(ConnectionError::ConnectInProgress),
                ConnectionState::Connected => return Err(ConnectionError::AlreadyConnected),
                ConnectionState::Disconnected | ConnectionState::Lost => {}
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            inner.target = Some(target.clone());
            inner.generation
        };
        info!(
            "Connecting to {} tool server {}",
            target.kind(),
            target.path().display()
        );

        match self.establish(&target, generation).await {
            Ok(session) => {
                let session = Arc::new(session);
                let tools = session.tools.clone();
                let accepted = self.transition(|inner| {
                    if inner.generation == generation && inner.state == ConnectionState::Connecting
                    {
                        inner.state = ConnectionState::Connected;
                        inner.session = Some(Arc::clone(&session));
                        (Some(true), true)
                    } else {
                        (None, false)
                    }
                });
                if !accepted {
                    debug!("Discarding connection superseded by a disconnect");
                    if let Err(e) = session.channel.close().await {
                        debug!("Closing superseded connection failed: {e}");
                    }
                    return Err(ConnectionError::ConnectAborted);
                }
                self.watch_for_loss(&session);
                info!(
                    "Connected to tool server '{}' {} with {} tool(s)",
                    session.server.name,
                    session.server.version,
                    tools.len()
                );
                Ok(tools)
            }
            Err(err) => {
                warn!("Tool server connection failed: {err}");
                self.transition(|inner| {
                    if inner.generation == generation && inner.state == ConnectionState::Connecting
                    {
                        inner.state = ConnectionState::Disconnected;
                        inner.session = None;
                        (Some(false), ())
                    } else {
                        (None, ())
                    }
                });
                Err(err)
            }
        }
    }

    /// Mark the session lost as soon as its channel closes, even when no
    /// call is in flight to notice.
    fn watch_for_loss(&self, session: &Session) {
        let closed = session.channel.closed();
        let shared = Arc::clone(&self.shared);
        let generation = session.generation;
        tokio::spawn(async move {
            closed.await;
            shared.mark_lost(generation, &ProtocolError::Closed).await;
        });
    }

    async fn establish(
        &self,
        target: &ScriptTarget,
        generation: u64,
    ) -> Result<Session, ConnectionError> {
        let channel = self.launcher.launch(target)?;

        let handshake = async {
            let server = protocol::initialize(channel.as_ref(), &self.config)
                .await
                .map_err(|source| ConnectionError::Handshake { source })?;
            let tools = protocol::list_tools(channel.as_ref())
                .await
                .map_err(|source| ConnectionError::Catalogue { source })?;
            Ok::<_, ConnectionError>((server, tools))
        };

        let outcome = match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout(self.config.handshake_timeout)),
        };

        match outcome {
            Ok((server, tools)) => Ok(Session {
                generation,
                channel,
                server,
                tools,
            }),
            Err(err) => {
                if let Err(e) = channel.close().await {
                    debug!("Closing failed tool server failed: {e}");
                }
                Err(err)
            }
        }
    }

    /// Call a tool on the connected server and return its result unmodified.
    ///
    /// Fails without any I/O when not connected or when `name` is not in the
    /// catalogue (the error lists the known names). A connection-loss failure
    /// moves the manager to `Lost` and notifies listeners before the
    /// [`ConnectionError::ConnectionLost`] is returned. Never retries.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ConnectionError> {
        let session = {
            let inner = self.lock_inner();
            match (inner.state, &inner.session) {
                (ConnectionState::Connected, Some(session)) => Arc::clone(session),
                (state, _) => return Err(ConnectionError::NotConnected { state }),
            }
        };

        let Some(tool) = session.tool(name) else {
            return Err(ConnectionError::UnknownTool {
                name: name.to_string(),
                available: session.tool_names(),
            });
        };
        if self.config.validate_arguments {
            validate_arguments(&tool.input_schema, &arguments).map_err(|message| {
                ConnectionError::InvalidArguments {
                    tool: name.to_string(),
                    message,
                }
            })?;
        }

        log_tool_call(name, &arguments);
        let start = Instant::now();

        match protocol::call_tool(session.channel.as_ref(), name, arguments).await {
            Ok(result) => {
                debug!(
                    "Tool {name} completed in {:.0}ms",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                Ok(result)
            }
            Err(ProtocolError::Rpc { code, message, .. }) => {
                debug!("Tool {name} rejected by server: {code} {message}");
                Err(ConnectionError::Server {
                    tool: name.to_string(),
                    code,
                    message,
                })
            }
            Err(source) => {
                self.shared.mark_lost(session.generation, &source).await;
                Err(ConnectionError::ConnectionLost {
                    tool: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Close the connection, clear the catalogue, and notify `false`.
    ///
    /// The state is `Disconnected` afterwards even if closing fails; the close
    /// error is still returned.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let (previous, session) = self.transition(|inner| {
            let previous = inner.state;
            inner.state = ConnectionState::Disconnected;
            inner.generation += 1;
            (Some(false), (previous, inner.session.take()))
        });
        info!("Disconnected from tool server (was {previous})");

        if let Some(session) = session {
            session.channel.close().await.map_err(|source| {
                warn!("Tool server did not close cleanly: {source}");
                ConnectionError::Close { source }
            })?;
        }
        Ok(())
    }
}
