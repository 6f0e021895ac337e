//! The contract between the loader and a module.
//!
//! A [`Module`] is resolved from its manifest's entry reference. Starting it
//! yields a [`ModuleInstance`]: either stateless (nothing to stop, nothing to
//! report) or stateful, in which case the loader keeps the returned
//! [`ModuleRuntime`] and drives its `stop` and `status` operations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::registry::{HandlerError, Tool, ToolCallResult, ToolHandler, ToolRegistry};

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Loaded but not running.
    Stopped,
    /// `start` is in progress.
    Starting,
    /// Started and healthy.
    Running,
    /// Start failed, timed out, or a dependency failed.
    Failed,
    /// `stop` is in progress.
    Stopping,
    /// Running but reporting partial health.
    Degraded,
}

impl ModuleState {
    /// Returns `true` for states in which the module's tools are served.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }

    /// Returns the state name as used in health descriptors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a running module reports about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStatus {
    /// `true` if the module only partially works.
    pub degraded: bool,
    /// Free-form, module-specific detail.
    pub detail: Option<Value>,
}

impl RuntimeStatus {
    /// Fully healthy, no detail.
    #[must_use]
    pub const fn healthy() -> Self {
        Self {
            degraded: false,
            detail: None,
        }
    }

    /// Healthy, with detail.
    #[must_use]
    pub const fn with_detail(detail: Value) -> Self {
        Self {
            degraded: false,
            detail: Some(detail),
        }
    }

    /// Partially working.
    #[must_use]
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            degraded: true,
            detail: Some(Value::String(reason.into())),
        }
    }
}

/// Live state of a stateful module.
#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    /// Releases the module's resources. Bounded by the loader's stop timeout.
    async fn stop(&mut self) -> Result<(), HandlerError>;

    /// Reports current health.
    fn status(&self) -> RuntimeStatus {
        RuntimeStatus::healthy()
    }
}

/// What a module's start operation returns.
pub enum ModuleInstance {
    /// Only registers tools; nothing to stop.
    Stateless,
    /// Holds live state the loader must stop later.
    Stateful(Box<dyn ModuleRuntime>),
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stateless => f.write_str("Stateless"),
            Self::Stateful(_) => f.write_str("Stateful(..)"),
        }
    }
}

/// A loadable unit of tools.
#[async_trait]
pub trait Module: Send + Sync {
    /// Starts the module: registers its tools and returns its instance.
    ///
    /// Bounded by the loader's start timeout. Tools registered before a
    /// failure or timeout are removed again by the loader.
    async fn start(&self, ctx: ModuleContext) -> Result<ModuleInstance, HandlerError>;
}

/// A running dependency, as seen by the module that depends on it.
#[derive(Clone)]
pub struct DependencyHandle {
    name: String,
    version: String,
    registry: Arc<ToolRegistry>,
}

impl DependencyHandle {
    pub(crate) const fn new(name: String, version: String, registry: Arc<ToolRegistry>) -> Self {
        Self {
            name,
            version,
            registry,
        }
    }

    /// The dependency's module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The dependency's version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Tools the dependency currently provides.
    #[must_use]
    pub fn tools(&self) -> Vec<String> {
        self.registry.names_owned_by(&self.name)
    }

    /// Calls one of the dependency's tools by its local name.
    ///
    /// # Errors
    ///
    /// Same as [`ToolRegistry::call`].
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<ToolCallResult, ToolError> {
        self.registry
            .call(&format!("{}:{tool}", self.name), arguments)
            .await
    }
}

impl fmt::Debug for DependencyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyHandle")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Registers tools under one module's namespace.
#[derive(Clone)]
pub struct ToolRegistrar {
    module: String,
    registry: Arc<ToolRegistry>,
}

impl ToolRegistrar {
    pub(crate) const fn new(module: String, registry: Arc<ToolRegistry>) -> Self {
        Self { module, registry }
    }

    /// Registers `<module>:<name>`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidName`] or [`ToolError::Collision`].
    pub fn register(
        &self,
        name: &str,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), ToolError> {
        let tool = Tool::new(
            format!("{}:{name}", self.module),
            description,
            input_schema,
            handler,
        )
        .owned_by(self.module.clone());
        self.registry.register(tool, false)
    }
}

impl fmt::Debug for ToolRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistrar")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// Everything a module receives when it starts.
#[derive(Debug)]
pub struct ModuleContext {
    /// The module's name.
    pub name: String,
    /// Manifest defaults merged with configured overrides.
    pub config: Map<String, Value>,
    /// One entry per declared dependency; `None` for absent optional ones.
    pub dependencies: BTreeMap<String, Option<DependencyHandle>>,
    /// Registers tools in the module's namespace.
    pub tools: ToolRegistrar,
}

impl ModuleContext {
    /// Returns a dependency if it is present.
    #[must_use]
    pub fn dependency(&self, name: &str) -> Option<&DependencyHandle> {
        self.dependencies.get(name).and_then(Option::as_ref)
    }

    /// Reads a string setting.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Health descriptor for operational tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleHealth {
    /// Module name.
    pub name: String,
    /// Module version.
    pub version: String,
    /// Current state.
    pub state: ModuleState,
    /// Module-reported detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Tools the module currently provides.
    pub tools: Vec<String>,
    /// Most recent lifecycle error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
