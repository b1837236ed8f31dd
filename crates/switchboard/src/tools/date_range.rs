//! `resolve_date_range`: the date-range resolver as a callable tool.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolFuture, parse_tool_args};
use crate::connection::ToolDescriptor;
use crate::dates::DateRangeResolver;
use crate::json_schema_for;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DateRangeArgs {
    /// Date expression, e.g. "last week", "Q1 2025", "last 30 days",
    /// "2025-07-28".
    pub expression: String,
}

/// Resolves a natural-language date expression into an inclusive range.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateRangeTool {
    resolver: DateRangeResolver,
}

impl DateRangeTool {
    pub const NAME: &'static str = "resolve_date_range";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(resolver: DateRangeResolver) -> Self {
        Self { resolver }
    }
}

impl Tool for DateRangeTool {
    fn definition(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            Self::NAME,
            "Convert a date expression (today, last week, this quarter, Q1 2025, \
             last 30 days, a year, or a literal date) into start and end dates. \
             Weeks start on Monday; both ends are inclusive.",
            json_schema_for::<DateRangeArgs>(),
        )
    }

    fn execute(&self, arguments: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: DateRangeArgs = parse_tool_args(Self::NAME, arguments)?;
            let resolved = self.resolver.resolve(&args.expression)?;
            Ok(json!(resolved))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DateRangeError, ToolError};
    use chrono::NaiveDate;

    fn tool() -> DateRangeTool {
        DateRangeTool::with_resolver(DateRangeResolver::fixed(
            NaiveDate::from_ymd_opt(2025, 11, 15).unwrap(),
        ))
    }

    #[test]
    fn schema_requires_expression() {
        let def = tool().definition();
        assert_eq!(def.name, "resolve_date_range");
        assert_eq!(def.input_schema["type"], "object");
        assert!(
            def.input_schema["required"]
                .as_array()
                .unwrap()
                .contains(&"expression".into())
        );
    }

    #[tokio::test]
    async fn resolves_into_json() {
        let result = tool()
            .execute(json!({"expression": "next quarter"}))
            .await
            .unwrap();
        assert_eq!(result["start"], "2026-01-01");
        assert_eq!(result["end"], "2026-03-31");
        assert_eq!(result["start_display"], "January 1, 2026");
    }

    #[tokio::test]
    async fn unrecognized_expression_is_surfaced() {
        let err = tool()
            .execute(json!({"expression": "someday"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::DateRange(DateRangeError::Unrecognized { .. })
        ));
    }
}
