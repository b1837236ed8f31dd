//! Caller-facing tool layer.
//!
//! The [`Tool`] trait describes an in-process tool: a [`ToolDescriptor`] and
//! an async `execute` over JSON arguments. [`ToolRouter`] dispatches a named
//! call to a local tool, or, when no local tool has that name, to the
//! subprocess tool server behind a
//! [`ToolConnectionManager`](crate::connection::ToolConnectionManager).
//!
//! Built-in local tools:
//!
//! - [`DateRangeTool`]: `resolve_date_range`, exposes the
//!   [`DateRangeResolver`](crate::dates::DateRangeResolver).
//! - [`GatewayQueryTool`]: one named GET endpoint of the remote API, with
//!   optional date-range resolution into `start_date` / `end_date`.

pub mod date_range;
pub mod query;
pub mod router;

use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::connection::ToolDescriptor;
use crate::error::ToolError;

pub use date_range::{DateRangeArgs, DateRangeTool};
pub use query::{GatewayQueryTool, QueryArgs};
pub use router::ToolRouter;

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// An in-process tool.
///
/// Uses a boxed future so the trait stays dyn-compatible.
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDescriptor;

    fn execute(&self, arguments: Value) -> ToolFuture<'_>;

    fn name(&self) -> String {
        self.definition().name
    }
}

/// Deserialize raw arguments into a typed struct.
pub fn parse_tool_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// Check `arguments` against a JSON Schema. An unusable schema skips
/// validation. On failure, returns one line per violation.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let Ok(validator) = jsonschema::validator_for(schema) else {
        debug!("Skipping argument validation: invalid input schema");
        return Ok(());
    };
    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Characters of rendered arguments shown in the INFO-level call log.
const PREVIEW_CHARS: usize = 120;

/// Log a tool call at INFO level with a truncated preview of arguments.
pub(crate) fn log_tool_call(name: &str, arguments: &Value) {
    let rendered = arguments.to_string();
    info!("[tool] {name}({})", preview(&rendered));
    trace!("[tool] {name} arguments: {rendered}");
}

/// First [`PREVIEW_CHARS`] characters of `rendered`, with `...` appended
/// only when something was cut.
fn preview(rendered: &str) -> String {
    let mut chars = rendered.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preview_counts_characters_not_bytes() {
        let accented = "é".repeat(100);
        assert_eq!(preview(&accented), accented);

        let exact = "x".repeat(PREVIEW_CHARS);
        assert_eq!(preview(&exact), exact);

        let long = "ü".repeat(PREVIEW_CHARS + 1);
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), PREVIEW_CHARS + 3);
    }

    #[test]
    fn validation_reports_each_violation() {
        let schema = json!({
            "type": "object",
            "properties": {"limit": {"type": "integer"}, "status": {"type": "string"}},
            "required": ["status"],
        });
        assert!(validate_arguments(&schema, &json!({"status": "open", "limit": 3})).is_ok());

        let message = validate_arguments(&schema, &json!({"limit": "three"})).unwrap_err();
        assert!(message.contains("/limit"));
        assert!(message.contains("status"));
    }

    #[test]
    fn broken_schema_skips_validation() {
        let schema = json!({"type": 12});
        assert!(validate_arguments(&schema, &json!({"anything": true})).is_ok());
    }

    #[test]
    fn typed_args_errors_name_the_tool() {
        #[derive(serde::Deserialize, Debug)]
        struct Args {
            #[allow(dead_code)]
            expression: String,
        }
        let err = parse_tool_args::<Args>("resolve_date_range", json!({})).unwrap_err();
        assert!(err.to_string().contains("resolve_date_range"));
        assert!(err.to_string().contains("expression"));
    }
}
