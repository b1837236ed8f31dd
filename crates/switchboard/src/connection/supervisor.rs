//! Auto-reconnect supervisor.
//!
//! A background task that keeps one [`ToolConnectionManager`] connected to
//! one script. It retries a failed startup with exponential backoff
//! (`min(base * 2^attempt, max_delay)`) up to [`ReconnectPolicy::max_attempts`]
//! and then gives up. With [`ReconnectPolicy::reconnect_on_loss`] it also
//! reconnects after a connection is lost mid-session.
//!
//! The supervisor observes the manager through a connection listener that
//! forwards events into a channel, so reconnect attempts never run inside a
//! listener callback. An explicit [`disconnect`](ToolConnectionManager::disconnect)
//! after the first successful connection stops it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConnectionState, ScriptTarget, ToolConnectionManager};
use crate::config::ReconnectPolicy;
use crate::error::ConnectionError;

/// Why a supervisor task finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Connected, and the policy does not watch for later losses.
    Connected,
    /// Every attempt in one outage failed.
    GaveUp { attempts: u32, last_error: String },
    /// The script can never be launched (e.g. unsupported extension).
    Misconfigured(String),
    /// The manager was disconnected explicitly.
    Stopped,
}

/// Spawn the supervisor for `script` on the current Tokio runtime.
pub fn spawn_reconnect_supervisor(
    manager: Arc<ToolConnectionManager>,
    script: impl Into<PathBuf>,
    policy: ReconnectPolicy,
) -> JoinHandle<SupervisorExit> {
    let script = script.into();
    tokio::spawn(async move { supervise(manager, script, policy).await })
}

async fn supervise(
    manager: Arc<ToolConnectionManager>,
    script: PathBuf,
    policy: ReconnectPolicy,
) -> SupervisorExit {
    if let Err(e) = ScriptTarget::new(script.as_path()) {
        warn!("Reconnect supervisor not started: {e}");
        return SupervisorExit::Misconfigured(e.to_string());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = manager.on_connection_change(move |connected| {
        let _ = tx.send(connected);
    });

    let exit = watch(&manager, &script, &policy, &mut rx).await;
    subscription.unsubscribe();
    debug!("Reconnect supervisor finished: {exit:?}");
    exit
}

enum Attempt {
    Connected,
    /// Someone else's connect is in flight; wait for its outcome.
    Busy,
    Exit(SupervisorExit),
}

async fn watch(
    manager: &ToolConnectionManager,
    script: &Path,
    policy: &ReconnectPolicy,
    events: &mut mpsc::UnboundedReceiver<bool>,
) -> SupervisorExit {
    let mut ever_connected = false;

    loop {
        match manager.state() {
            ConnectionState::Connected => {
                ever_connected = true;
                if !policy.reconnect_on_loss {
                    return SupervisorExit::Connected;
                }
                if events.recv().await.is_none() {
                    return SupervisorExit::Stopped;
                }
            }
            ConnectionState::Connecting => {
                if events.recv().await.is_none() {
                    return SupervisorExit::Stopped;
                }
            }
            ConnectionState::Disconnected if ever_connected => {
                info!("Tool server disconnected explicitly; reconnect supervisor stopping");
                return SupervisorExit::Stopped;
            }
            state @ (ConnectionState::Disconnected | ConnectionState::Lost) => {
                if state == ConnectionState::Lost {
                    info!("Tool server connection lost; reconnecting");
                }
                match reconnect(manager, script, policy).await {
                    Attempt::Connected => ever_connected = true,
                    Attempt::Busy => {
                        if events.recv().await.is_none() {
                            return SupervisorExit::Stopped;
                        }
                    }
                    Attempt::Exit(exit) => return exit,
                }
            }
        }
    }
}

/// One outage: connect with backoff until success or the attempt budget runs out.
async fn reconnect(
    manager: &ToolConnectionManager,
    script: &Path,
    policy: &ReconnectPolicy,
) -> Attempt {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt - 1);
            debug!("Reconnect attempt {} of {attempts} in {delay:?}", attempt + 1);
            tokio::time::sleep(delay).await;
        }

        match manager.connect(script).await {
            Ok(tools) => {
                info!(
                    "Tool server connected on attempt {} with {} tool(s)",
                    attempt + 1,
                    tools.len()
                );
                return Attempt::Connected;
            }
            Err(ConnectionError::AlreadyConnected) => return Attempt::Connected,
            Err(ConnectionError::ConnectInProgress) => return Attempt::Busy,
            Err(ConnectionError::ConnectAborted) => {
                return Attempt::Exit(SupervisorExit::Stopped);
            }
            Err(ConnectionError::Config(e)) => {
                return Attempt::Exit(SupervisorExit::Misconfigured(e.to_string()));
            }
            Err(e) => {
                warn!("Connect attempt {} of {attempts} failed: {e}", attempt + 1);
                last_error = e.to_string();
            }
        }
    }

    warn!("Giving up on tool server after {attempts} attempt(s)");
    Attempt::Exit(SupervisorExit::GaveUp {
        attempts,
        last_error,
    })
}
