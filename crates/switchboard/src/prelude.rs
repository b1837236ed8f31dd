//! Convenience re-exports for common `switchboard` types.
//!
//! ```ignore
//! use switchboard::prelude::*;
//! ```

// ── Connection ──────────────────────────────────────────────────────
pub use crate::connection::{
    ConnectionState, ConnectionSubscription, SupervisorExit, ToolConnectionManager,
    ToolDescriptor, spawn_reconnect_supervisor,
};

// ── Gateway ─────────────────────────────────────────────────────────
pub use crate::api::{QueryParams, RetryingHttpGateway};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{
    ConnectionConfig, GatewayConfig, RateLimitConfig, ReconnectPolicy, RetryPolicy,
};

// ── Dates ───────────────────────────────────────────────────────────
pub use crate::dates::{DateRange, DateRangeResolver, ResolvedDateRange, resolve_date_range};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{ConnectionError, DateRangeError, GatewayError, ToolError};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::json_schema_for;
pub use crate::tools::{
    DateRangeTool, GatewayQueryTool, Tool, ToolFuture, ToolRouter, parse_tool_args,
};

pub use serde_json::json;
