//! In-memory tool servers for manager and supervisor tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::Notify;

use super::protocol::{Launcher, ProtocolFuture, ToolChannel, ToolDescriptor};
use super::script::ScriptTarget;
use crate::error::{ConnectionError, ProtocolError};

/// Behaviour of one launched fake server.
#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    pub tools: Vec<ToolDescriptor>,
    pub fail_spawn: bool,
    pub fail_initialize: bool,
    /// `initialize` waits for this before answering.
    pub hold_initialize: Option<Arc<Notify>>,
    /// Calls to this tool report a dropped connection.
    pub lose_on: Option<String>,
    /// Calls to this tool return a JSON-RPC error.
    pub reject: Option<String>,
    pub fail_close: bool,
    /// The server goes away on its own once this is notified.
    pub hang_up: Option<Arc<Notify>>,
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| tool(n)).collect(),
            ..Default::default()
        }
    }
}

pub(crate) fn tool(name: &str) -> ToolDescriptor {
    ToolDescriptor::new(
        name,
        format!("{name} tool"),
        json!({
            "type": "object",
            "properties": {"limit": {"type": "integer"}},
        }),
    )
}

/// Hands out fake servers in order; the last one is reused once the queue
/// runs dry. Every channel records the methods it received in `calls`.
pub(crate) struct FakeLauncher {
    servers: Mutex<VecDeque<FakeServer>>,
    last: Mutex<FakeServer>,
    pub launches: AtomicUsize,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new(servers: Vec<FakeServer>) -> Arc<Self> {
        let last = servers.last().cloned().unwrap_or_default();
        Arc::new(Self {
            servers: Mutex::new(servers.into()),
            last: Mutex::new(last),
            launches: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, target: &ScriptTarget) -> Result<Arc<dyn ToolChannel>, ConnectionError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let server = self
            .servers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.last.lock().unwrap().clone());
        if server.fail_spawn {
            return Err(ConnectionError::Spawn {
                interpreter: target.kind().interpreter(),
                path: target.path().to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no interpreter"),
            });
        }
        Ok(Arc::new(FakeChannel {
            server,
            calls: Arc::clone(&self.calls),
        }))
    }
}

pub(crate) struct FakeChannel {
    server: FakeServer,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ToolChannel for FakeChannel {
    fn request(&self, method: &str, params: Option<Value>) -> ProtocolFuture<'_, Value> {
        let method = method.to_string();
        Box::pin(async move {
            self.calls.lock().unwrap().push(method.clone());
            match method.as_str() {
                "initialize" => {
                    if let Some(gate) = &self.server.hold_initialize {
                        gate.notified().await;
                    }
                    if self.server.fail_initialize {
                        return Err(ProtocolError::Rpc {
                            code: -32603,
                            message: "server failed to start".into(),
                            data: None,
                        });
                    }
                    Ok(json!({
                        "protocolVersion": super::protocol::PROTOCOL_VERSION,
                        "serverInfo": {"name": "fake", "version": "1.0.0"},
                    }))
                }
                "tools/list" => Ok(json!({ "tools": self.server.tools })),
                "tools/call" => {
                    let params = params.unwrap_or_default();
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    if self.server.lose_on.as_deref() == Some(name.as_str()) {
                        // Stay in flight for one poll so concurrent calls overlap.
                        tokio::task::yield_now().await;
                        return Err(ProtocolError::Closed);
                    }
                    if self.server.reject.as_deref() == Some(name.as_str()) {
                        return Err(ProtocolError::Rpc {
                            code: -32602,
                            message: format!("bad arguments for {name}"),
                            data: None,
                        });
                    }
                    Ok(json!({
                        "content": [{"type": "text", "text": format!("called {name}")}],
                        "structuredContent": {"tool": name, "arguments": params["arguments"]},
                        "isError": false,
                    }))
                }
                other => Err(ProtocolError::Rpc {
                    code: -32601,
                    message: format!("unknown method {other}"),
                    data: None,
                }),
            }
        })
    }

    fn notify(&self, method: &str, _params: Option<Value>) -> ProtocolFuture<'_, ()> {
        let method = method.to_string();
        Box::pin(async move {
            self.calls.lock().unwrap().push(method);
            Ok(())
        })
    }

    fn close(&self) -> ProtocolFuture<'_, ()> {
        Box::pin(async move {
            self.calls.lock().unwrap().push("close".into());
            if self.server.fail_close {
                Err(ProtocolError::Io(std::io::Error::other("close failed")))
            } else {
                Ok(())
            }
        })
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        match &self.server.hang_up {
            Some(signal) => {
                let signal = Arc::clone(signal);
                Box::pin(async move { signal.notified().await })
            }
            None => Box::pin(futures::future::pending()),
        }
    }
}

/// Listener that records every notification it sees.
pub(crate) fn recording_listener() -> (Arc<Mutex<Vec<bool>>>, impl Fn(bool) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |connected| sink.lock().unwrap().push(connected))
}
