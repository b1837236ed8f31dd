//! Tool invocation core for a business chat assistant.
//!
//! `switchboard` sits between a conversational front end and the systems it
//! acts on. It owns three things:
//!
//! 1. **The tool-server connection.** [`ToolConnectionManager`] runs a
//!    subprocess tool server (Python, Node or shell script) over
//!    newline-delimited JSON-RPC, tracks its [`ConnectionState`] and tool
//!    catalogue, and notifies listeners on every change. A
//!    [reconnect supervisor](connection::spawn_reconnect_supervisor) restores
//!    failed or lost connections with exponential backoff.
//! 2. **The remote business API.** [`RetryingHttpGateway`] is the only path
//!    to it: one shared fixed-window quota, a timeout per attempt, and bounded
//!    retries for overload, upstream rate limiting and unavailability.
//! 3. **Date ranges.** [`DateRangeResolver`] turns "last week", "Q1 2025" or
//!    "last 30 days" into concrete inclusive dates, Monday-first.
//!
//! The [`tools`] layer wraps these for callers: a [`ToolRouter`] dispatches a
//! named call to an in-process [`Tool`] or to the tool server.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard::prelude::*;
//!
//! let manager = Arc::new(ToolConnectionManager::new(ConnectionConfig::default()));
//! manager.connect("tools/server.py").await?;
//!
//! let gateway = Arc::new(RetryingHttpGateway::new(GatewayConfig::from_env()?)?);
//! let router = ToolRouter::new()
//!     .with(DateRangeTool::new())
//!     .with(GatewayQueryTool::new("get_sales", "Sales totals", "sales", gateway))
//!     .with_remote(manager);
//!
//! let result = router
//!     .execute("get_sales", json!({"date_range": "last month"}))
//!     .await?;
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | [`ToolConnectionManager`], wire protocol, script kinds, reconnect supervisor |
//! | [`api`] | [`RetryingHttpGateway`], [`RateLimiter`](api::RateLimiter), retry policy helpers |
//! | [`dates`] | [`DateRangeResolver`] and the date expression rules |
//! | [`tools`] | [`Tool`] trait, [`ToolRouter`], built-in date and gateway tools |
//! | [`config`] | Configuration structs and environment loading |
//! | [`error`] | Error enums for each component |

pub mod api;
pub mod config;
pub mod connection;
pub mod dates;
pub mod error;
pub mod prelude;
pub mod tools;

use schemars::JsonSchema;

pub use api::RetryingHttpGateway;
pub use connection::{ConnectionState, ToolConnectionManager, ToolDescriptor};
pub use dates::{DateRange, DateRangeResolver, ResolvedDateRange, resolve_date_range};
pub use tools::{Tool, ToolRouter};

// Re-export schemars for downstream tool authors.
pub use schemars;

/// Generate a JSON Schema `serde_json::Value` for a `schemars::JsonSchema`
/// type. Used for tool `inputSchema`s.
///
/// # Example
///
/// ```
/// use switchboard::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct OrderArgs {
///     status: String,
///     #[serde(default)]
///     limit: Option<u32>,
/// }
///
/// let schema = json_schema_for::<OrderArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"status".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}
