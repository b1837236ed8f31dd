//! Dispatch of named tool calls to local tools or the tool server.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use super::{Tool, log_tool_call, validate_arguments};
use crate::connection::{ToolConnectionManager, ToolDescriptor};
use crate::error::{ConnectionError, ToolError};

/// Routes a tool name to the tool that implements it.
///
/// Local tools take precedence over remote tools of the same name. Remote
/// calls pass through [`ToolConnectionManager::invoke`], so its connection
/// state checks apply. An unknown name reports every routable tool, local
/// names first.
///
/// ```ignore
/// let router = ToolRouter::new()
///     .with(DateRangeTool::new())
///     .with(GatewayQueryTool::new("get_sales", "Sales totals", "sales", gateway))
///     .with_remote(manager)
///     .with_arg_validation(true);
/// let result = router.execute("get_sales", json!({"date_range": "last week"})).await?;
/// ```
#[derive(Default)]
pub struct ToolRouter {
    local: BTreeMap<String, Box<dyn Tool>>,
    remote: Option<Arc<ToolConnectionManager>>,
    validate_args: bool,
}

impl fmt::Debug for ToolRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRouter")
            .field("local", &self.local.keys().collect::<Vec<_>>())
            .field("remote", &self.remote.as_ref().map(|m| m.state()))
            .field("validate_args", &self.validate_args)
            .finish()
    }
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local tool. Replaces any local tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.local.insert(tool.name(), Box::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Fall back to the tool server for names with no local tool.
    pub fn with_remote(mut self, manager: Arc<ToolConnectionManager>) -> Self {
        self.remote = Some(manager);
        self
    }

    /// Validate local tool arguments against their schema before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Local descriptors (by name), then the current remote catalogue minus
    /// names shadowed locally.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> = self.local.values().map(|t| t.definition()).collect();
        if let Some(manager) = &self.remote {
            all.extend(
                manager
                    .tools()
                    .into_iter()
                    .filter(|t| !self.local.contains_key(&t.name)),
            );
        }
        all
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.local.contains_key(name)
            || self
                .remote
                .as_ref()
                .is_some_and(|m| m.tool_names().iter().any(|n| n == name))
    }

    /// Execute `name` with `arguments`.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let Some(tool) = self.local.get(name) else {
            return match &self.remote {
                Some(manager) => manager
                    .invoke(name, arguments)
                    .await
                    .map_err(|e| self.with_local_names(e)),
                None => Err(ToolError::UnknownTool {
                    name: name.to_string(),
                    available: self.local.keys().cloned().collect(),
                }),
            };
        };

        if self.validate_args {
            let schema = tool.definition().input_schema;
            validate_arguments(&schema, &arguments).map_err(|message| {
                ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message,
                }
            })?;
        }

        log_tool_call(name, &arguments);
        let start = Instant::now();
        let result = tool.execute(arguments).await;
        debug!(
            "Tool {name} completed in {:.0}ms (ok={})",
            start.elapsed().as_secs_f64() * 1000.0,
            result.is_ok()
        );
        result
    }

    /// Widen the manager's unknown-tool error to the full routable set.
    fn with_local_names(&self, err: ConnectionError) -> ToolError {
        match err {
            ConnectionError::UnknownTool { name, available } => {
                let mut names: Vec<String> = self.local.keys().cloned().collect();
                names.extend(
                    available
                        .into_iter()
                        .filter(|n| !self.local.contains_key(n)),
                );
                ToolError::UnknownTool {
                    name,
                    available: names,
                }
            }
            other => other.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::Launcher;
    use crate::connection::testing::{FakeLauncher, FakeServer};
    use crate::dates::DateRangeResolver;
    use crate::tools::DateRangeTool;
    use chrono::NaiveDate;
    use serde_json::json;

    fn date_tool() -> DateRangeTool {
        DateRangeTool::with_resolver(DateRangeResolver::fixed(
            NaiveDate::from_ymd_opt(2025, 7, 28).unwrap(),
        ))
    }

    async fn connected(names: &[&str]) -> (Arc<FakeLauncher>, Arc<ToolConnectionManager>) {
        let launcher = FakeLauncher::new(vec![FakeServer::with_tools(names)]);
        let manager = Arc::new(ToolConnectionManager::with_launcher(
            Arc::clone(&launcher) as Arc<dyn Launcher>,
            ConnectionConfig::default(),
        ));
        manager.connect("server.py").await.unwrap();
        (launcher, manager)
    }

    #[tokio::test]
    async fn local_tool_runs_in_process() {
        let router = ToolRouter::new().with(date_tool());
        let result = router
            .execute("resolve_date_range", json!({"expression": "last week"}))
            .await
            .unwrap();
        assert_eq!(result["start"], "2025-07-21");
        assert_eq!(result["days"], 7);
    }

    #[tokio::test]
    async fn unknown_name_without_remote_lists_local_tools() {
        let router = ToolRouter::new().with(date_tool());
        let err = router.execute("refund", json!({})).await.unwrap_err();
        match err {
            ToolError::UnknownTool { name, available } => {
                assert_eq!(name, "refund");
                assert_eq!(available, vec!["resolve_date_range"]);
            }
            other => panic!("expected unknown tool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_tools_are_reached_through_the_manager() {
        let (launcher, manager) = connected(&["get_orders"]).await;
        let router = ToolRouter::new().with(date_tool()).with_remote(manager);

        assert!(router.has_tool("get_orders"));
        let result = router.execute("get_orders", json!({"limit": 2})).await.unwrap();
        assert_eq!(result["structuredContent"]["tool"], "get_orders");
        assert!(launcher.calls().contains(&"tools/call".to_string()));

        let err = router.execute("refund", json!({})).await.unwrap_err();
        match err {
            ToolError::UnknownTool { name, available } => {
                assert_eq!(name, "refund");
                assert_eq!(available, vec!["resolve_date_range", "get_orders"]);
            }
            other => panic!("expected unknown tool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_name_lists_shadowed_tools_once() {
        let (_launcher, manager) = connected(&["resolve_date_range", "get_orders"]).await;
        let router = ToolRouter::new().with(date_tool()).with_remote(manager);

        let err = router.execute("refund", json!({})).await.unwrap_err();
        match err {
            ToolError::UnknownTool { available, .. } => {
                assert_eq!(available, vec!["resolve_date_range", "get_orders"]);
            }
            other => panic!("expected unknown tool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnected_remote_is_a_connection_error() {
        let (_launcher, manager) = connected(&["get_orders"]).await;
        manager.disconnect().await.unwrap();
        let router = ToolRouter::new().with(date_tool()).with_remote(manager);

        let err = router.execute("get_orders", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Connection(_)));
    }

    #[tokio::test]
    async fn local_names_shadow_remote_ones() {
        let (launcher, manager) = connected(&["resolve_date_range", "get_orders"]).await;
        let router = ToolRouter::new().with(date_tool()).with_remote(manager);

        let names: Vec<String> = router.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["resolve_date_range", "get_orders"]);

        router
            .execute("resolve_date_range", json!({"expression": "today"}))
            .await
            .unwrap();
        assert!(!launcher.calls().contains(&"tools/call".to_string()));
    }

    #[tokio::test]
    async fn validation_rejects_bad_local_arguments() {
        let router = ToolRouter::new().with(date_tool()).with_arg_validation(true);
        let err = router
            .execute("resolve_date_range", json!({"expression": 7}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
