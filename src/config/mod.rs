//! Loading of the JSON configuration file.
//!
//! # Lookup order
//!
//! 1. Path given on the command line; it must exist.
//! 2. Default location, used only if it exists:
//!    - **Linux/macOS:** `~/.mcp-plugin-host/config.json`
//!    - **Windows:** `%USERPROFILE%\.mcp-plugin-host\config.json`
//!
//! Without either, built-in defaults apply: stdio transport and the built-in modules.

mod settings;

pub use settings::{
    Config, HttpConfig, LogFormat, LoggingConfig, ModulesConfig, RateLimitConfig, SessionConfig,
    ToolsConfig, TransportKind,
};

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.mcp-plugin-host/`
/// - **Windows:** `%USERPROFILE%\.mcp-plugin-host\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-plugin-host"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and validates the configuration.
///
/// If `path` is `None`, the default location is tried and built-in defaults
/// are used when no file exists there.
///
/// # Errors
///
/// Returns an error if:
/// - An explicitly given file does not exist
/// - The file cannot be read
/// - The JSON is malformed or has unknown fields
/// - A value fails validation
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => {
                debug!("No configuration file, using defaults");
                return Ok(Config::default());
            }
        },
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path.clone(),
        source: e,
    })?;

    config.validate()?;

    Ok(config)
}
