//! Configuration types for the gateway, the tool-server connection, and the
//! reconnect supervisor.
//!
//! Every type has working defaults; override through struct fields or the
//! `with_*` builder methods:
//!
//! ```ignore
//! let gateway = GatewayConfig::new("https://api.example.com/v1/")
//!     .with_credential("api_key", key)
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retry(RetryPolicy::default().with_max_retries(5));
//! ```
//!
//! [`GatewayConfig::from_env`] reads the deployment environment and fails
//! with [`ConfigError::MissingEnv`] before any network I/O when a value is
//! absent.

use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable holding the business API base URL.
pub const ENV_API_URL: &str = "SWITCHBOARD_API_URL";
/// Environment variable holding the `api_key` credential.
pub const ENV_API_KEY: &str = "SWITCHBOARD_API_KEY";
/// Environment variable holding the `token` credential.
pub const ENV_API_TOKEN: &str = "SWITCHBOARD_API_TOKEN";

/// Default per-attempt HTTP timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// ── Rate limiting ─────────────────────────────────────────────────

/// Fixed-window request quota shared by every gateway caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per window. Default: 60.
    pub limit: u32,
    /// Window length. Default: 60 seconds.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

// ── Retry ─────────────────────────────────────────────────────────

/// Exponential backoff policy for transient gateway failures.
///
/// The delay before retry `n` (0-indexed) is `base_delay * 2^n`. A
/// `Retry-After` hint on a 429 replaces the computed delay, capped at
/// `max_retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = fail on first error). Default: 3.
    pub max_retries: u32,
    /// Delay before the first retry. Default: 1 second.
    pub base_delay: Duration,
    /// Upper bound for server-provided `Retry-After` waits. Default: 60 seconds.
    pub max_retry_after: Duration,
    /// Pause before returning a result that needed retries. Default: 250ms.
    pub pacing_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(60),
            pacing_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_pacing_delay(mut self, delay: Duration) -> Self {
        self.pacing_delay = delay;
        self
    }
}

// ── Gateway ───────────────────────────────────────────────────────

/// Settings for [`RetryingHttpGateway`](crate::api::RetryingHttpGateway).
#[derive(Clone)]
pub struct GatewayConfig {
    /// Base URL every endpoint is resolved against.
    pub base_url: String,
    /// Fixed query parameters appended to every request. Callers never see
    /// these and cannot override them.
    pub credentials: Vec<(String, String)>,
    /// Per-attempt timeout. Default: 30 seconds.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub user_agent: String,
}

// Credentials stay out of debug output.
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.credentials.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("credentials", &names)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("rate_limit", &self.rate_limit)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: Vec::new(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            user_agent: format!("switchboard/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Read the base URL and credentials from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), with an injectable variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup(ENV_API_URL).ok_or(ConfigError::MissingEnv(ENV_API_URL))?;
        let api_key = lookup(ENV_API_KEY).ok_or(ConfigError::MissingEnv(ENV_API_KEY))?;
        let token = lookup(ENV_API_TOKEN).ok_or(ConfigError::MissingEnv(ENV_API_TOKEN))?;

        let config = Self::new(base_url)
            .with_credential("api_key", api_key)
            .with_credential("token", token);
        config.validate()?;
        Ok(config)
    }

    /// Add a fixed credential query parameter.
    pub fn with_credential(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Check credentials for empty values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in &self.credentials {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyCredential(name.clone()));
            }
        }
        Ok(())
    }
}

// ── Tool-server connection ────────────────────────────────────────

/// Settings for [`ToolConnectionManager`](crate::connection::ToolConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bound on the `initialize` + `tools/list` exchange. Default: 30 seconds.
    pub handshake_timeout: Duration,
    /// Client name announced during the handshake.
    pub client_name: String,
    /// Client version announced during the handshake.
    pub client_version: String,
    /// Protocol revision requested from the server.
    pub protocol_version: String,
    /// Validate arguments against the tool's `inputSchema` before dispatch.
    pub validate_arguments: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: crate::connection::protocol::PROTOCOL_VERSION.to_string(),
            validate_arguments: false,
        }
    }
}

impl ConnectionConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_argument_validation(mut self, enabled: bool) -> Self {
        self.validate_arguments = enabled;
        self
    }
}

// ── Reconnect supervisor ──────────────────────────────────────────

/// Backoff schedule for the auto-reconnect supervisor.
///
/// Attempt `n` (0-indexed) waits `min(base_delay * 2^n, max_delay)` after
/// failing. The supervisor stops after `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Default: 1 second.
    pub base_delay: Duration,
    /// Default: 30 seconds.
    pub max_delay: Duration,
    /// Total connect attempts per outage, including the first. Default: 5.
    pub max_attempts: u32,
    /// Reconnect after a connection is lost mid-session, not only at
    /// startup. Default: `true`.
    pub reconnect_on_loss: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            reconnect_on_loss: true,
        }
    }
}

impl ReconnectPolicy {
    /// Wait after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_reconnect_on_loss(mut self, enabled: bool) -> Self {
        self.reconnect_on_loss = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn from_lookup_reads_url_and_credentials() {
        let vars = env(&[
            (ENV_API_URL, "https://api.example.com/v1/"),
            (ENV_API_KEY, "key-123"),
            (ENV_API_TOKEN, "tok-456"),
        ]);
        let config = GatewayConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.base_url, "https://api.example.com/v1/");
        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.timeout, DEFAULT_HTTP_TIMEOUT);
    }

    #[test]
    fn missing_credential_is_reported_by_name() {
        let vars = env(&[(ENV_API_URL, "https://api.example.com/")]);
        let err = GatewayConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(ENV_API_KEY)));
    }

    #[test]
    fn empty_credential_rejected() {
        let vars = env(&[
            (ENV_API_URL, "https://api.example.com/"),
            (ENV_API_KEY, "  "),
            (ENV_API_TOKEN, "tok"),
        ]);
        let err = GatewayConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCredential(name) if name == "api_key"));
    }

    #[test]
    fn debug_output_hides_credential_values() {
        let config = GatewayConfig::new("https://api.example.com/").with_credential("api_key", "s3cret");
        let debug = format!("{config:?}");
        assert!(debug.contains("api_key"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn reconnect_delay_doubles_then_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }
}
