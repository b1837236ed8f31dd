//! Gateway-backed query tools.
//!
//! A [`GatewayQueryTool`] exposes one GET endpoint of the remote API. Its
//! handler follows the usual pattern: resolve the optional date range, add it
//! to the query as `start_date` / `end_date`, then call the gateway.

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolFuture, parse_tool_args};
use crate::api::{QueryParams, RetryingHttpGateway};
use crate::connection::ToolDescriptor;
use crate::dates::DateRangeResolver;
use crate::error::ToolError;
use crate::json_schema_for;

/// Query parameter names for a resolved date range.
pub const START_DATE_PARAM: &str = "start_date";
pub const END_DATE_PARAM: &str = "end_date";

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct QueryArgs {
    /// Extra query parameters for the endpoint. Values must be strings,
    /// numbers or booleans.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Optional date expression such as "last month" or "Q2 2025".
    #[serde(default)]
    pub date_range: Option<String>,
}

/// One remote endpoint as a tool.
pub struct GatewayQueryTool {
    name: String,
    description: String,
    endpoint: String,
    gateway: Arc<RetryingHttpGateway>,
    resolver: DateRangeResolver,
}

impl GatewayQueryTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        endpoint: impl Into<String>,
        gateway: Arc<RetryingHttpGateway>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            endpoint: endpoint.into(),
            gateway,
            resolver: DateRangeResolver::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: DateRangeResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn query_params(&self, parameters: BTreeMap<String, Value>) -> Result<QueryParams, ToolError> {
        parameters
            .into_iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(ToolError::InvalidArguments {
                            tool: self.name.clone(),
                            message: format!("parameter '{key}' must be a scalar, got {other}"),
                        });
                    }
                };
                Ok((key, rendered))
            })
            .collect()
    }
}

impl Tool for GatewayQueryTool {
    fn definition(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            &self.name,
            &self.description,
            json_schema_for::<QueryArgs>(),
        )
    }

    fn execute(&self, arguments: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: QueryArgs = parse_tool_args(&self.name, arguments)?;
            let mut params = self.query_params(args.parameters)?;

            let range = match args.date_range.as_deref() {
                Some(expression) => {
                    let resolved = self.resolver.resolve(expression)?;
                    params.insert(START_DATE_PARAM.to_string(), resolved.start_iso());
                    params.insert(END_DATE_PARAM.to_string(), resolved.end_iso());
                    Some(resolved)
                }
                None => None,
            };

            let data = self.gateway.call(&self.endpoint, &params).await?;
            Ok(json!({
                "endpoint": self.endpoint,
                "date_range": range,
                "data": data,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HttpResponse, HttpTransport};
    use crate::config::GatewayConfig;
    use crate::error::{DateRangeError, GatewayError, TransportError};
    use chrono::NaiveDate;
    use futures::future::BoxFuture;
    use reqwest::Url;
    use std::sync::Mutex;

    /// Answers every request with the same response and keeps the URLs.
    struct Canned {
        status: u16,
        body: &'static str,
        urls: Mutex<Vec<Url>>,
    }

    impl HttpTransport for Canned {
        fn get<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
            self.urls.lock().unwrap().push(url.clone());
            Box::pin(async move {
                Ok(HttpResponse {
                    status: self.status,
                    retry_after: None,
                    body: self.body.to_string(),
                })
            })
        }
    }

    fn sales_tool(status: u16, body: &'static str) -> (Arc<Canned>, GatewayQueryTool) {
        let transport = Arc::new(Canned {
            status,
            body,
            urls: Mutex::new(Vec::new()),
        });
        let gateway = RetryingHttpGateway::with_transport(
            GatewayConfig::new("https://api.example.com").with_credential("api_key", "secret"),
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
        )
        .unwrap();
        let tool = GatewayQueryTool::new("get_sales", "Sales totals", "sales", Arc::new(gateway))
            .with_resolver(DateRangeResolver::fixed(
                NaiveDate::from_ymd_opt(2025, 7, 28).unwrap(),
            ));
        (transport, tool)
    }

    fn query_of(url: &Url) -> BTreeMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[tokio::test]
    async fn date_range_becomes_start_and_end() {
        let (transport, tool) = sales_tool(200, r#"{"total": 1200}"#);

        let result = tool
            .execute(json!({
                "parameters": {"channel": "web", "limit": 10},
                "date_range": "last week",
            }))
            .await
            .unwrap();

        assert_eq!(result["data"]["total"], 1200);
        assert_eq!(result["date_range"]["days"], 7);

        let urls = transport.urls.lock().unwrap();
        let query = query_of(&urls[0]);
        assert_eq!(urls[0].path(), "/sales");
        assert_eq!(query["start_date"], "2025-07-21");
        assert_eq!(query["end_date"], "2025-07-27");
        assert_eq!(query["channel"], "web");
        assert_eq!(query["limit"], "10");
        assert_eq!(query["api_key"], "secret");
    }

    #[tokio::test]
    async fn bad_date_range_skips_the_gateway() {
        let (transport, tool) = sales_tool(200, "{}");
        let err = tool
            .execute(json!({"date_range": "whenever"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::DateRange(DateRangeError::Unrecognized { .. })
        ));
        assert!(transport.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn nested_parameters_rejected() {
        let (_, tool) = sales_tool(200, "{}");
        let err = tool
            .execute(json!({"parameters": {"filter": {"a": 1}}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn terminal_upstream_error_is_surfaced() {
        let (_, tool) = sales_tool(404, "no such report");
        let err = tool.execute(json!({})).await.unwrap_err();
        match err {
            ToolError::Gateway(GatewayError::Upstream { status, body, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "no such report");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }
}
