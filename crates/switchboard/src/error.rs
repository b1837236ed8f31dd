//! Error taxonomy for the tool invocation core.
//!
//! Each component has its own error enum so callers can match on the failure
//! class instead of inspecting message text:
//!
//! | Type | Raised by |
//! |------|-----------|
//! | [`ConfigError`] | script targets, gateway and environment configuration |
//! | [`ProtocolError`] | the tool-server wire channel |
//! | [`ConnectionError`] | [`ToolConnectionManager`](crate::connection::ToolConnectionManager) |
//! | [`GatewayError`] | [`RetryingHttpGateway`](crate::api::RetryingHttpGateway) |
//! | [`DateRangeError`] | [`DateRangeResolver`](crate::dates::DateRangeResolver) |
//! | [`ToolError`] | the caller-facing [`ToolRouter`](crate::tools::ToolRouter) |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Configuration problems. Always raised before any process or network I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported tool server script '{}': expected a .py, .js or .sh file", path.display())]
    UnsupportedScript { path: PathBuf },

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("credential '{0}' is empty")]
    EmptyCredential(String),

    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Failures on the JSON-RPC channel to a tool server.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("tool server closed the connection")]
    Closed,

    #[error("tool server I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed tool server message: {0}")]
    Malformed(String),

    /// The server answered with a JSON-RPC error object. This is the tool
    /// server's own error channel and does not mean the connection is gone.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl ProtocolError {
    /// Whether this failure means the channel can no longer be trusted.
    pub fn is_connection_loss(&self) -> bool {
        !matches!(self, Self::Rpc { .. })
    }
}

/// Errors from connecting to and invoking tools on a tool server.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start {interpreter} for '{}': {source}", path.display())]
    Spawn {
        interpreter: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tool server handshake failed: {source}")]
    Handshake {
        #[source]
        source: ProtocolError,
    },

    #[error("tool server handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("failed to fetch tool catalogue: {source}")]
    Catalogue {
        #[source]
        source: ProtocolError,
    },

    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    #[error("already connected to a tool server; disconnect first")]
    AlreadyConnected,

    #[error("connection attempt was cancelled by a concurrent disconnect")]
    ConnectAborted,

    #[error("not connected to a tool server (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("unknown tool '{name}'; available tools: [{}]", available.join(", "))]
    UnknownTool {
        name: String,
        available: Vec<String>,
    },

    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("connection lost while calling '{tool}': {source}")]
    ConnectionLost {
        tool: String,
        #[source]
        source: ProtocolError,
    },

    #[error("tool server rejected '{tool}' (code {code}): {message}")]
    Server {
        tool: String,
        code: i64,
        message: String,
    },

    #[error("failed to close tool server connection: {source}")]
    Close {
        #[source]
        source: ProtocolError,
    },
}

impl ConnectionError {
    /// Whether the manager moved to `Lost` because of this error.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}

/// Transport-level failure reported by an
/// [`HttpTransport`](crate::api::HttpTransport) before any HTTP status exists.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Errors from the rate-limited retrying gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Quota for the current window is used up. Never queued.
    #[error("rate limit reached calling '{endpoint}'; retry in {retry_after:?}")]
    RateLimited {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("request to '{endpoint}' timed out after {timeout:?} (attempt {attempt})")]
    Timeout {
        endpoint: String,
        timeout: Duration,
        attempt: u32,
    },

    #[error("request to '{endpoint}' failed (attempt {attempt}): {source}")]
    Network {
        endpoint: String,
        attempt: u32,
        #[source]
        source: TransportError,
    },

    #[error("'{endpoint}' returned HTTP {status} (attempt {attempt}): {body}")]
    Upstream {
        endpoint: String,
        status: u16,
        attempt: u32,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid JSON from '{endpoint}': {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid URL for endpoint '{endpoint}': {reason}")]
    InvalidUrl { endpoint: String, reason: String },

    #[error("'{endpoint}' still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last: Box<GatewayError>,
    },
}

impl GatewayError {
    /// Whether the failure class is eligible for another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Upstream { status, .. } => crate::api::retry::is_retryable_status(*status),
            _ => false,
        }
    }

    /// HTTP status of the failure, looking through exhausted retries.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            Self::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Server-provided wait hint from a `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Upstream { retry_after, .. } => *retry_after,
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Date expressions that cannot be turned into a range.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("unrecognized date expression '{expression}'")]
    Unrecognized { expression: String },

    #[error("date expression '{expression}' is outside the supported calendar range")]
    OutOfRange { expression: String },
}

/// Errors surfaced through the [`ToolRouter`](crate::tools::ToolRouter).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    DateRange(#[from] DateRangeError),

    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("unknown tool '{name}'; available tools: [{}]", available.join(", "))]
    UnknownTool {
        name: String,
        available: Vec<String>,
    },
}
