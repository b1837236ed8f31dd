//! Operator CLI for the tool invocation core.
//!
//! # Examples
//!
//! ```sh
//! # Resolve a date expression (optionally against a fixed "today")
//! switchboard dates "last week" --today 2025-07-28
//!
//! # Connect to a tool server and list its tools
//! switchboard tools ./tools/server.py
//!
//! # Invoke one tool
//! switchboard call ./tools/server.py get_orders --args '{"limit": 5}'
//!
//! # Call the remote API (SWITCHBOARD_API_URL, SWITCHBOARD_API_KEY and
//! # SWITCHBOARD_API_TOKEN must be set)
//! switchboard get sales/summary -p region=emea -p date_range="last month"
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to adjust (default `switchboard=info`).

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::Value;
use switchboard::api::QueryParams;
use switchboard::config::{ConnectionConfig, GatewayConfig};
use switchboard::dates::DateRangeResolver;
use switchboard::tools::query::{END_DATE_PARAM, START_DATE_PARAM};
use switchboard::{RetryingHttpGateway, ToolConnectionManager};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Tool invocation core: tool-server connections, the rate-limited API
/// gateway, and date-range resolution.
#[derive(Parser)]
#[command(name = "switchboard", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a date expression and print the range as JSON
    Dates {
        /// Expression such as "last week", "Q1 2025" or "last 30 days"
        expression: String,

        /// Resolve relative to this date (YYYY-MM-DD) instead of today
        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// Connect to a tool server and print its tool catalogue
    Tools {
        /// Tool-server script (.py, .js or .sh)
        script: PathBuf,

        /// Handshake timeout in seconds
        #[arg(long, default_value_t = 30)]
        handshake_timeout: u64,
    },

    /// Connect to a tool server and invoke one tool
    Call {
        /// Tool-server script (.py, .js or .sh)
        script: PathBuf,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Validate arguments against the tool's input schema first
        #[arg(long)]
        validate: bool,

        /// Handshake timeout in seconds
        #[arg(long, default_value_t = 30)]
        handshake_timeout: u64,
    },

    /// Call a remote API endpoint through the gateway
    Get {
        /// Endpoint path relative to SWITCHBOARD_API_URL
        endpoint: String,

        /// Query parameter (repeatable). `date_range=<expr>` is resolved
        /// into start_date/end_date.
        #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("switchboard=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn to_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to render JSON: {e}"))
}

fn connection_config(handshake_timeout: u64, validate: bool) -> ConnectionConfig {
    ConnectionConfig::default()
        .with_handshake_timeout(Duration::from_secs(handshake_timeout))
        .with_argument_validation(validate)
}

async fn run(cli: Cli) -> Result<String, String> {
    match cli.command {
        Command::Dates { expression, today } => {
            let resolver = today.map_or_else(DateRangeResolver::new, DateRangeResolver::fixed);
            let resolved = resolver.resolve(&expression).map_err(|e| e.to_string())?;
            to_pretty(&resolved)
        }

        Command::Tools {
            script,
            handshake_timeout,
        } => {
            let manager = ToolConnectionManager::new(connection_config(handshake_timeout, false));
            let tools = manager.connect(&script).await.map_err(|e| e.to_string())?;
            let rendered = to_pretty(&tools);
            if let Err(e) = manager.disconnect().await {
                tracing::warn!("{e}");
            }
            rendered
        }

        Command::Call {
            script,
            tool,
            args,
            validate,
            handshake_timeout,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).map_err(|e| format!("invalid --args JSON: {e}"))?;
            let manager =
                ToolConnectionManager::new(connection_config(handshake_timeout, validate));
            manager.connect(&script).await.map_err(|e| e.to_string())?;
            let outcome = manager.invoke(&tool, arguments).await;
            if let Err(e) = manager.disconnect().await {
                tracing::warn!("{e}");
            }
            to_pretty(&outcome.map_err(|e| e.to_string())?)
        }

        Command::Get { endpoint, params } => {
            let config = GatewayConfig::from_env().map_err(|e| e.to_string())?;
            let gateway = RetryingHttpGateway::new(config).map_err(|e| e.to_string())?;

            let mut query: QueryParams = params.into_iter().collect();
            if let Some(expression) = query.remove("date_range") {
                let resolved = DateRangeResolver::new()
                    .resolve(&expression)
                    .map_err(|e| e.to_string())?;
                query.insert(START_DATE_PARAM.to_string(), resolved.start_iso());
                query.insert(END_DATE_PARAM.to_string(), resolved.end_iso());
            }

            let value = gateway
                .call(&endpoint, &query)
                .await
                .map_err(|e| e.to_string())?;
            to_pretty(&value)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn key_value_params() {
        assert_eq!(
            parse_key_value("region=emea").unwrap(),
            ("region".to_string(), "emea".to_string())
        );
        assert_eq!(
            parse_key_value("q=a=b").unwrap(),
            ("q".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[tokio::test]
    async fn dates_command_prints_range() {
        let cli = Cli::parse_from(["switchboard", "dates", "Q1 2025", "--today", "2025-07-28"]);
        let output = run(cli).await.unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["start"], "2025-01-01");
        assert_eq!(value["end"], "2025-03-31");
    }
}
