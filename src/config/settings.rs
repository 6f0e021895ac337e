//! Typed view of the configuration file.
//!
//! Every section has defaults, so `{}` is a complete configuration. Unknown
//! keys are rejected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// The whole configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Which transport to serve.
    #[serde(default)]
    pub transport: TransportKind,

    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Session settings for the HTTP transport.
    #[serde(default)]
    pub session: SessionConfig,

    /// Per-client rate limiting. Absent means unlimited.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Tool call settings.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Module loading settings.
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::ValidationError { message });

        self.http.bind_addr()?;
        if !self.http.endpoint.starts_with('/') {
            return invalid(format!(
                "HTTP endpoint '{}' must start with '/'",
                self.http.endpoint
            ));
        }
        if self.http.endpoint == "/health" {
            return invalid("HTTP endpoint must not be '/health'".to_string());
        }

        for (name, secs) in [
            ("session.timeout_secs", self.session.timeout_secs),
            ("session.sweep_interval_secs", self.session.sweep_interval_secs),
            ("tools.call_timeout_secs", self.tools.call_timeout_secs),
            ("modules.start_timeout_secs", self.modules.start_timeout_secs),
            ("modules.stop_timeout_secs", self.modules.stop_timeout_secs),
        ] {
            if secs == 0 {
                return invalid(format!("{name} must be greater than 0"));
            }
        }

        if let Some(limit) = &self.rate_limit {
            if !(limit.requests_per_second.is_finite() && limit.requests_per_second > 0.0) {
                return invalid(format!(
                    "rate_limit.requests_per_second must be greater than 0, got {}",
                    limit.requests_per_second
                ));
            }
            if limit.burst == 0 {
                return invalid("rate_limit.burst must be at least 1".to_string());
            }
        }

        Ok(())
    }
}

/// Transport binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON over stdin/stdout.
    #[default]
    Stdio,
    /// Streamable HTTP.
    Http,
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Socket address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path of the MCP endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Origins or hosts allowed to connect; `*` allows any.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Stream replies as SSE whenever the client accepts it.
    #[serde(default)]
    pub stream_responses: bool,
}

impl HttpConfig {
    /// Parses the bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if `bind` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::ValidationError {
                message: format!("Invalid HTTP bind address '{}': {e}", self.bind),
            })
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            endpoint: default_endpoint(),
            allowed_origins: default_allowed_origins(),
            stream_responses: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8931".to_string()
}

fn default_endpoint() -> String {
    "/mcp".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ]
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Idle time after which a session expires.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    /// Interval between expiry sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    /// The idle timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

const fn default_session_timeout() -> u64 {
    1800
}

const fn default_sweep_interval() -> u64 {
    30
}

/// Token bucket parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Sustained request rate per client.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Requests a client may make in a burst.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

const fn default_requests_per_second() -> f64 {
    20.0
}

const fn default_burst() -> u32 {
    40
}

/// Tool call configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Time budget for a single tool call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl ToolsConfig {
    /// The call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
        }
    }
}

const fn default_call_timeout() -> u64 {
    30
}

/// Module loading configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModulesConfig {
    /// Directory holding one subdirectory per module. Absent loads the built-in modules.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Modules that must start, or startup is aborted.
    #[serde(default)]
    pub required: Vec<String>,

    /// Time budget for a module's start.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Time budget for a module's stop.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Per-module overrides of manifest configuration.
    #[serde(default)]
    pub config: HashMap<String, Map<String, Value>>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            directory: None,
            required: Vec::new(),
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            config: HashMap::new(),
        }
    }
}

const fn default_start_timeout() -> u64 {
    10
}

const fn default_stop_timeout() -> u64 {
    30
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
