//! Error types for mcp-plugin-host.
//!
//! Every error that can reach a client maps onto one [`ErrorKind`], which in
//! turn fixes the JSON-RPC error code and the `data.kind` string of the
//! error response. Request-scoped errors are converted into error responses
//! at the protocol boundary; module lifecycle errors are returned as values
//! from the loader so a batch load degrades instead of aborting.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// The fixed error taxonomy surfaced to clients and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The message was not valid JSON.
    ParseFailure,
    /// Valid JSON, but not a valid JSON-RPC request.
    MalformedRequest,
    /// The method is not one the server implements.
    UnknownMethod,
    /// Method parameters are missing or ill-typed.
    InvalidParameters,
    /// A method other than `initialize` arrived before initialisation.
    NotInitialized,
    /// The named tool is not registered.
    ToolNotFound,
    /// Tool arguments failed schema validation.
    ToolInvalidParameters,
    /// The tool handler returned an error or panicked.
    ToolExecutionFailure,
    /// The tool handler exceeded its time budget.
    ToolTimeout,
    /// Missing, unknown or expired session id.
    SessionInvalid,
    /// A required module dependency is not available.
    ModuleMissingDependency,
    /// Modules depend on each other in a cycle.
    ModuleCircularDependency,
    /// A module failed to load or start.
    ModuleStartFailure,
    /// A module did not stop within its time budget.
    ModuleStopTimeout,
    /// The client exhausted its request budget.
    RateLimited,
    /// The request origin is not on the allow-list.
    OriginRejected,
    /// Anything unexpected.
    Internal,
}

impl ErrorKind {
    /// Returns the stable kebab-case name used in `error.data.kind`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseFailure => "parse-failure",
            Self::MalformedRequest => "malformed-request",
            Self::UnknownMethod => "unknown-method",
            Self::InvalidParameters => "invalid-parameters",
            Self::NotInitialized => "not-initialized",
            Self::ToolNotFound => "tool-not-found",
            Self::ToolInvalidParameters => "tool-invalid-parameters",
            Self::ToolExecutionFailure => "tool-execution-failure",
            Self::ToolTimeout => "tool-timeout",
            Self::SessionInvalid => "session-invalid",
            Self::ModuleMissingDependency => "module-missing-dependency",
            Self::ModuleCircularDependency => "module-circular-dependency",
            Self::ModuleStartFailure => "module-start-failure",
            Self::ModuleStopTimeout => "module-stop-timeout",
            Self::RateLimited => "rate-limited",
            Self::OriginRejected => "origin-rejected",
            Self::Internal => "internal",
        }
    }

    /// Returns the JSON-RPC error code for this kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseFailure => -32700,
            Self::MalformedRequest => -32600,
            Self::UnknownMethod => -32601,
            Self::InvalidParameters => -32602,
            Self::Internal => -32603,
            Self::NotInitialized => -32002,
            Self::ToolNotFound => -32010,
            Self::ToolInvalidParameters => -32011,
            Self::ToolExecutionFailure => -32012,
            Self::ToolTimeout => -32013,
            Self::SessionInvalid => -32020,
            Self::RateLimited => -32029,
            Self::OriginRejected => -32030,
            Self::ModuleMissingDependency => -32040,
            Self::ModuleCircularDependency => -32041,
            Self::ModuleStartFailure => -32042,
            Self::ModuleStopTimeout => -32043,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// A single schema violation, precise enough for a client to fix its call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// JSON pointer to the offending value (`""` for the root).
    pub path: String,
    /// What the schema expected at this location.
    pub expected: String,
    /// What was actually received.
    pub received: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(
            f,
            "{path}: expected {}, received {}",
            self.expected, self.received
        )
    }
}

/// Errors raised by the tool registry.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    /// The tool name does not follow the `module:tool` convention.
    #[error("invalid tool name '{name}': tool names must be namespaced as 'module:tool'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A tool with the same name is already registered.
    #[error("tool '{name}' is already registered by module '{owner}'")]
    Collision {
        /// The contested name.
        name: String,
        /// Module that owns the existing registration.
        owner: String,
    },

    /// No tool with this name is registered.
    #[error("tool '{name}' not found")]
    NotFound {
        /// The requested name.
        name: String,
        /// Names currently registered.
        available: Vec<String>,
    },

    /// Arguments do not match the tool's input schema.
    #[error("invalid arguments for tool '{name}': {}", summarize(.errors))]
    InvalidArguments {
        /// The tool that was called.
        name: String,
        /// Field-level violations.
        errors: Vec<FieldError>,
    },

    /// The handler returned an error or panicked.
    #[error("tool '{name}' failed: {cause}")]
    ExecutionFailed {
        /// The tool that was called.
        name: String,
        /// Simplified top-level cause.
        cause: String,
        /// Truncated chain of underlying causes.
        trace: Vec<String>,
    },

    /// The handler did not finish in time.
    #[error("tool '{name}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The tool that was called.
        name: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ToolError {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. } | Self::Collision { .. } => ErrorKind::InvalidParameters,
            Self::NotFound { .. } => ErrorKind::ToolNotFound,
            Self::InvalidArguments { .. } => ErrorKind::ToolInvalidParameters,
            Self::ExecutionFailed { .. } => ErrorKind::ToolExecutionFailure,
            Self::Timeout { .. } => ErrorKind::ToolTimeout,
        }
    }

    /// Structured context for the `error.data` member of a response.
    #[must_use]
    pub fn data(&self) -> Value {
        let kind = self.kind().as_str();
        match self {
            Self::InvalidName { name } => json!({ "kind": kind, "tool": name }),
            Self::Collision { name, owner } => {
                json!({ "kind": kind, "tool": name, "owner": owner })
            }
            Self::NotFound { name, available } => {
                json!({ "kind": kind, "tool": name, "available": available })
            }
            Self::InvalidArguments { name, errors } => {
                json!({ "kind": kind, "tool": name, "errors": errors })
            }
            Self::ExecutionFailed { name, cause, trace } => {
                json!({ "kind": kind, "tool": name, "cause": cause, "trace": trace })
            }
            Self::Timeout { name, timeout } => json!({
                "kind": kind,
                "tool": name,
                "timeoutMs": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

/// Errors raised while loading, starting or stopping modules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// The manifest could not be read or is invalid.
    #[error("invalid manifest {path}: {message}")]
    InvalidManifest {
        /// Manifest location.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// A required dependency is not part of the candidate set.
    #[error("module '{module}' requires missing dependency '{dependency}'")]
    MissingDependency {
        /// The dependent module.
        module: String,
        /// The absent dependency.
        dependency: String,
    },

    /// The module participates in a dependency cycle.
    #[error("circular dependency: {}", .cycle.join(" -> "))]
    CircularDependency {
        /// The cycle path, first element repeated at the end.
        cycle: Vec<String>,
    },

    /// A dependency of the module failed, so the module cannot start.
    #[error("module '{module}' cannot start because dependency '{dependency}' failed")]
    DependencyFailed {
        /// The dependent module.
        module: String,
        /// The failed dependency.
        dependency: String,
    },

    /// The entry reference does not resolve to a known module implementation.
    #[error("module '{module}' has unknown entry point '{entry}'")]
    UnknownEntry {
        /// The module.
        module: String,
        /// The unresolved entry reference.
        entry: String,
    },

    /// Two candidate manifests use the same module name.
    #[error("module '{module}' is declared more than once")]
    Duplicate {
        /// The duplicated name.
        module: String,
    },

    /// No module with this name is known to the loader.
    #[error("module '{module}' is not loaded")]
    NotLoaded {
        /// The requested module.
        module: String,
    },

    /// The module's start operation failed.
    #[error("module '{module}' failed to start: {message}")]
    StartFailed {
        /// The module.
        module: String,
        /// Reported cause.
        message: String,
    },

    /// The module's start operation exceeded its budget.
    #[error("module '{module}' did not start within {}ms", .timeout.as_millis())]
    StartTimeout {
        /// The module.
        module: String,
        /// The exceeded budget.
        timeout: Duration,
    },

    /// The module's stop operation exceeded its budget.
    #[error("module '{module}' did not stop within {}ms", .timeout.as_millis())]
    StopTimeout {
        /// The module.
        module: String,
        /// The exceeded budget.
        timeout: Duration,
    },
}

impl ModuleError {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingDependency { .. } => ErrorKind::ModuleMissingDependency,
            Self::CircularDependency { .. } => ErrorKind::ModuleCircularDependency,
            Self::StopTimeout { .. } => ErrorKind::ModuleStopTimeout,
            Self::InvalidManifest { .. }
            | Self::DependencyFailed { .. }
            | Self::UnknownEntry { .. }
            | Self::Duplicate { .. }
            | Self::NotLoaded { .. }
            | Self::StartFailed { .. }
            | Self::StartTimeout { .. } => ErrorKind::ModuleStartFailure,
        }
    }
}

/// Errors raised by the session manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The request did not carry a session id.
    #[error("missing session id")]
    Missing,

    /// The session id is unknown, terminated or expired.
    #[error("session '{id}' is not valid")]
    Invalid {
        /// The rejected id.
        id: String,
    },
}

impl SessionError {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::SessionInvalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "invalid setting".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid setting"));
    }

    #[test]
    fn kinds_have_distinct_codes() {
        let kinds = [
            ErrorKind::ParseFailure,
            ErrorKind::MalformedRequest,
            ErrorKind::UnknownMethod,
            ErrorKind::InvalidParameters,
            ErrorKind::NotInitialized,
            ErrorKind::ToolNotFound,
            ErrorKind::ToolInvalidParameters,
            ErrorKind::ToolExecutionFailure,
            ErrorKind::ToolTimeout,
            ErrorKind::SessionInvalid,
            ErrorKind::ModuleMissingDependency,
            ErrorKind::ModuleCircularDependency,
            ErrorKind::ModuleStartFailure,
            ErrorKind::ModuleStopTimeout,
            ErrorKind::RateLimited,
            ErrorKind::OriginRejected,
            ErrorKind::Internal,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn kind_serialises_as_kebab_case() {
        let value = serde_json::to_value(ErrorKind::ToolTimeout).unwrap();
        assert_eq!(value, json!("tool-timeout"));
        assert_eq!(ErrorKind::ToolTimeout.as_str(), "tool-timeout");
    }

    #[test]
    fn collision_names_owner() {
        let error = ToolError::Collision {
            name: "demo:echo".to_string(),
            owner: "demo".to_string(),
        };
        assert!(error.to_string().contains("'demo'"));
        assert_eq!(error.data()["owner"], "demo");
    }

    #[test]
    fn invalid_arguments_lists_fields() {
        let error = ToolError::InvalidArguments {
            name: "math:add".to_string(),
            errors: vec![FieldError {
                path: "/a".to_string(),
                expected: "number".to_string(),
                received: "string".to_string(),
            }],
        };
        assert!(error.to_string().contains("/a: expected number, received string"));
        assert_eq!(error.data()["errors"][0]["expected"], "number");
    }

    #[test]
    fn circular_dependency_renders_path() {
        let error = ModuleError::CircularDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(error.to_string(), "circular dependency: a -> b -> a");
        assert_eq!(error.kind(), ErrorKind::ModuleCircularDependency);
    }
}
