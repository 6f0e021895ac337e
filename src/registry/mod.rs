//! Namespaced tool registry.
//!
//! Tools are registered under `module:tool` names. The registry keeps its
//! contents as an immutable map behind an [`Arc`]: readers take a cheap
//! snapshot and never wait for writers, while writers are serialised and
//! publish a fresh map. Tool calls run on their own task, bounded by a
//! timeout; a timed-out call is aborted at its next suspension point.

pub mod validator;

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::telemetry::Telemetry;
pub use validator::{BasicSchemaValidator, SchemaValidator};

/// Default time budget for a single tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of frames kept in an execution-failure trace.
const MAX_TRACE_FRAMES: usize = 8;

/// Maximum length of a single cause or trace frame.
const MAX_FRAME_LEN: usize = 240;

static TOOL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]+:[A-Za-z0-9_.-]+$").expect("Invalid regex: tool name pattern")
});

/// Error type returned by tool handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The callable part of a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    /// Runs the tool with already-validated arguments.
    async fn call(&self, arguments: Value) -> Result<Value, HandlerError>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> Result<Value, HandlerError> {
        (self.0)(arguments).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Public description of a tool, as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Namespaced tool name (`module:tool`).
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

/// A tool ready for registration.
#[derive(Clone)]
pub struct Tool {
    /// What clients see.
    pub definition: ToolDefinition,
    /// Module that owns the registration.
    pub owner: String,
    /// The implementation.
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    /// Creates a tool owned by the namespace part of its name.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        let name = name.into();
        let owner = name.split(':').next().unwrap_or_default().to_string();
        Self {
            definition: ToolDefinition {
                name,
                description: Some(description.into()),
                input_schema,
            },
            owner,
            handler,
        }
    }

    /// Overrides the owning module.
    #[must_use]
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Returns the tool's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("definition", &self.definition)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Content item in a tool call response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
}

/// Result of a successful tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content returned by the tool.
    pub content: Vec<ToolContent>,
    /// The raw value the handler produced.
    pub structured_content: Value,
}

impl ToolCallResult {
    /// Wraps a handler's return value.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let text = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            content: vec![ToolContent::Text { text }],
            structured_content: value,
        }
    }
}

/// Notifications published whenever the registry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A tool was added.
    Registered(String),
    /// An existing tool was replaced.
    Replaced(String),
    /// A tool was removed.
    Unregistered(String),
}

type ToolMap = IndexMap<String, Arc<Tool>>;

/// Concurrency-safe store of namespaced tools.
pub struct ToolRegistry {
    tools: RwLock<Arc<ToolMap>>,
    write_lock: Mutex<()>,
    validator: Arc<dyn SchemaValidator>,
    telemetry: Arc<dyn Telemetry>,
    call_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.current().keys().collect::<Vec<_>>())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new(
        validator: Arc<dyn SchemaValidator>,
        telemetry: Arc<dyn Telemetry>,
        call_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tools: RwLock::new(Arc::new(IndexMap::new())),
            write_lock: Mutex::new(()),
            validator,
            telemetry,
            call_timeout,
            events,
        }
    }

    /// Returns the configured per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Subscribes to registry change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn current(&self) -> Arc<ToolMap> {
        Arc::clone(&self.tools.read())
    }

    /// Applies `change` to a copy of the map and publishes it.
    ///
    /// Callers must hold `write_lock`.
    fn publish(&self, change: impl FnOnce(&mut ToolMap)) {
        let mut next = (*self.current()).clone();
        change(&mut next);
        *self.tools.write() = Arc::new(next);
    }

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidName`] for names that are not `module:tool`,
    /// and [`ToolError::Collision`] if the name is taken and `replace` is false.
    pub fn register(&self, tool: Tool, replace: bool) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if !TOOL_NAME.is_match(&name) {
            return Err(ToolError::InvalidName { name });
        }

        let _guard = self.write_lock.lock();
        let existing = self.current().get(&name).map(|t| t.owner.clone());

        match existing {
            Some(owner) if !replace => Err(ToolError::Collision { name, owner }),
            Some(previous_owner) => {
                let new_owner = tool.owner.clone();
                self.publish(|map| {
                    map.insert(name.clone(), Arc::new(tool));
                });
                warn!(tool = %name, previous_owner = %previous_owner, "Tool registration replaced");
                self.telemetry.event(
                    "tool.replaced",
                    json!({ "tool": name, "previousOwner": previous_owner, "owner": new_owner }),
                );
                let _ = self.events.send(RegistryEvent::Replaced(name));
                Ok(())
            }
            None => {
                let owner = tool.owner.clone();
                self.publish(|map| {
                    map.insert(name.clone(), Arc::new(tool));
                });
                debug!(tool = %name, owner = %owner, "Registered tool");
                self.telemetry
                    .event("tool.registered", json!({ "tool": name, "owner": owner }));
                let _ = self.events.send(RegistryEvent::Registered(name));
                Ok(())
            }
        }
    }

    /// Removes a tool. Returns `true` if it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let _guard = self.write_lock.lock();
        if !self.current().contains_key(name) {
            return false;
        }
        self.publish(|map| {
            map.shift_remove(name);
        });
        self.telemetry
            .event("tool.unregistered", json!({ "tool": name }));
        let _ = self.events.send(RegistryEvent::Unregistered(name.to_string()));
        true
    }

    /// Removes every tool owned by `owner` and returns their names.
    pub fn unregister_owner(&self, owner: &str) -> Vec<String> {
        let _guard = self.write_lock.lock();
        let removed = self.names_owned_by(owner);
        if removed.is_empty() {
            return removed;
        }
        self.publish(|map| map.retain(|_, t| t.owner != owner));
        for name in &removed {
            self.telemetry
                .event("tool.unregistered", json!({ "tool": name, "owner": owner }));
            let _ = self.events.send(RegistryEvent::Unregistered(name.clone()));
        }
        removed
    }

    /// Looks up a tool's definition.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        self.current().get(name).map(|t| t.definition.clone())
    }

    /// Returns the owner of a registered tool.
    #[must_use]
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.current().get(name).map(|t| t.owner.clone())
    }

    /// Returns a snapshot of all tool definitions in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.current()
            .values()
            .map(|t| t.definition.clone())
            .collect()
    }

    /// Returns the names of all registered tools.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.current().keys().cloned().collect()
    }

    /// Returns the names of the tools registered by `owner`.
    #[must_use]
    pub fn names_owned_by(&self, owner: &str) -> Vec<String> {
        self.current()
            .values()
            .filter(|t| t.owner == owner)
            .map(|t| t.definition.name.clone())
            .collect()
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current().len()
    }

    /// Returns `true` if no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// Calls a tool with the registry's default timeout.
    ///
    /// # Errors
    ///
    /// See [`ToolRegistry::call_with_timeout`].
    pub async fn call(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError> {
        self.call_with_timeout(name, arguments, self.call_timeout)
            .await
    }

    /// Validates the arguments and runs the tool's handler on its own task.
    ///
    /// # Errors
    ///
    /// - [`ToolError::NotFound`] if no such tool is registered
    /// - [`ToolError::InvalidArguments`] if the arguments do not match the schema
    /// - [`ToolError::Timeout`] if the handler exceeds `timeout`; the task is aborted
    /// - [`ToolError::ExecutionFailed`] if the handler errors or panics
    pub async fn call_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallResult, ToolError> {
        let tools = self.current();
        let Some(tool) = tools.get(name).cloned() else {
            return Err(ToolError::NotFound {
                name: name.to_string(),
                available: tools.keys().cloned().collect(),
            });
        };
        drop(tools);

        self.validator
            .validate(&tool.definition.input_schema, &arguments)
            .map_err(|errors| ToolError::InvalidArguments {
                name: name.to_string(),
                errors,
            })?;

        let handler = Arc::clone(&tool.handler);
        let mut task = tokio::spawn(async move { handler.call(arguments).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Err(_) => {
                task.abort();
                warn!(tool = %name, timeout = ?timeout, "Tool call timed out");
                Err(ToolError::Timeout {
                    name: name.to_string(),
                    timeout,
                })
            }
            Ok(Err(join_error)) => {
                let cause = if join_error.is_panic() {
                    format!("handler panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "handler was cancelled".to_string()
                };
                warn!(tool = %name, cause = %cause, "Tool handler aborted");
                Err(ToolError::ExecutionFailed {
                    name: name.to_string(),
                    cause: truncate(&cause),
                    trace: Vec::new(),
                })
            }
            Ok(Ok(Err(error))) => {
                debug!(tool = %name, error = %error, "Tool handler failed");
                Err(ToolError::ExecutionFailed {
                    name: name.to_string(),
                    cause: truncate(&error.to_string()),
                    trace: error_trace(error.as_ref()),
                })
            }
            Ok(Ok(Ok(value))) => Ok(ToolCallResult::from_value(value)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(
            Arc::new(BasicSchemaValidator),
            Arc::new(crate::telemetry::TracingTelemetry),
            DEFAULT_CALL_TIMEOUT,
        )
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_FRAME_LEN {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_FRAME_LEN - 1).collect();
    cut.push('…');
    cut
}

fn error_trace(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut trace = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        if trace.len() == MAX_TRACE_FRAMES {
            trace.push("…".to_string());
            break;
        }
        trace.push(truncate(&cause.to_string()));
        source = cause.source();
    }
    trace
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordingTelemetry;

    fn add_tool() -> Tool {
        Tool::new(
            "math:add",
            "Adds two numbers",
            json!({
                "type": "object",
                "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
                "required": ["a", "b"]
            }),
            handler_fn(|args: Value| async move {
                let a = args["a"].as_f64().unwrap_or_default();
                let b = args["b"].as_f64().unwrap_or_default();
                Ok::<_, HandlerError>(json!(a + b))
            }),
        )
    }

    fn echo_tool(reply: &'static str) -> Tool {
        Tool::new(
            "demo:echo",
            "Echo",
            json!({}),
            handler_fn(move |_| async move { Ok::<_, HandlerError>(json!(reply)) }),
        )
    }

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("query failed")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn rejects_unnamespaced_names() {
        let registry = ToolRegistry::default();
        for name in ["echo", ":echo", "demo:", "a:b:c", "demo echo:x"] {
            let tool = Tool::new(name, "", json!({}), handler_fn(|_| async { Ok::<_, HandlerError>(Value::Null) }));
            let err = registry.register(tool, false).unwrap_err();
            assert!(matches!(err, ToolError::InvalidName { .. }), "{name}");
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn collision_without_override_fails() {
        let registry = ToolRegistry::default();
        registry.register(echo_tool("first"), false).unwrap();

        let err = registry.register(echo_tool("second"), false).unwrap_err();
        match err {
            ToolError::Collision { name, owner } => {
                assert_eq!(name, "demo:echo");
                assert_eq!(owner, "demo");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn override_replaces_and_reports() {
        let telemetry = RecordingTelemetry::new();
        let registry = ToolRegistry::new(
            Arc::new(BasicSchemaValidator),
            telemetry.clone(),
            DEFAULT_CALL_TIMEOUT,
        );
        registry.register(echo_tool("first"), false).unwrap();
        registry
            .register(echo_tool("second").owned_by("other"), true)
            .unwrap();

        let result = registry.call("demo:echo", json!({})).await.unwrap();
        assert_eq!(result.structured_content, json!("second"));
        assert_eq!(registry.owner_of("demo:echo").as_deref(), Some("other"));
        let replaced = telemetry.named("tool.replaced");
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0]["previousOwner"], "demo");
    }

    #[test]
    fn list_is_a_snapshot() {
        let registry = ToolRegistry::default();
        registry.register(add_tool(), false).unwrap();
        let snapshot = registry.list();

        registry.register(echo_tool("x"), false).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list().len(), 2);
        assert_eq!(snapshot[0].name, "math:add");
    }

    #[test]
    fn unregister_and_unregister_owner() {
        let registry = ToolRegistry::default();
        registry.register(add_tool(), false).unwrap();
        registry.register(echo_tool("x"), false).unwrap();

        assert!(registry.unregister("demo:echo"));
        assert!(!registry.unregister("demo:echo"));
        assert_eq!(registry.unregister_owner("math"), vec!["math:add".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn changes_are_broadcast() {
        let registry = ToolRegistry::default();
        let mut events = registry.subscribe();
        registry.register(add_tool(), false).unwrap();
        registry.unregister("math:add");

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Registered("math:add".into())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Unregistered("math:add".into())
        );
    }

    #[tokio::test]
    async fn call_adds_numbers() {
        let registry = ToolRegistry::default();
        registry.register(add_tool(), false).unwrap();

        let result = registry.call("math:add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(result.structured_content, json!(5.0));
        assert_eq!(
            result.content,
            vec![ToolContent::Text { text: "5.0".to_string() }]
        );
    }

    #[tokio::test]
    async fn unknown_tool_lists_available() {
        let registry = ToolRegistry::default();
        registry.register(add_tool(), false).unwrap();

        let err = registry.call("math:sub", json!({})).await.unwrap_err();
        match err {
            ToolError::NotFound { available, .. } => assert_eq!(available, vec!["math:add"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_the_handler_runs() {
        let registry = ToolRegistry::default();
        registry.register(add_tool(), false).unwrap();

        let err = registry
            .call("math:add", json!({"a": "two"}))
            .await
            .unwrap_err();
        let ToolError::InvalidArguments { errors, .. } = err else {
            panic!("expected invalid arguments");
        };
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let registry = ToolRegistry::default();
        let slow = Tool::new(
            "demo:slow",
            "Sleeps",
            json!({}),
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, HandlerError>(Value::Null)
            }),
        );
        registry.register(slow, false).unwrap();

        let err = registry
            .call_with_timeout("demo:slow", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert_eq!(err.data()["timeoutMs"], 50);
    }

    #[tokio::test]
    async fn handler_errors_keep_a_trace() {
        let registry = ToolRegistry::default();
        let failing = Tool::new(
            "demo:fail",
            "Fails",
            json!({}),
            handler_fn(|_| async {
                Err::<Value, HandlerError>(Box::new(Outer(std::io::Error::other(
                    "connection reset",
                ))))
            }),
        );
        registry.register(failing, false).unwrap();

        let err = registry.call("demo:fail", json!({})).await.unwrap_err();
        let ToolError::ExecutionFailed { cause, trace, .. } = err else {
            panic!("expected execution failure");
        };
        assert_eq!(cause, "query failed");
        assert_eq!(trace, vec!["connection reset".to_string()]);
    }

    #[tokio::test]
    async fn handler_panics_are_contained() {
        let registry = ToolRegistry::default();
        let panicking = Tool::new(
            "demo:panic",
            "Panics",
            json!({}),
            handler_fn(|args: Value| async move {
                assert!(args.is_null(), "boom");
                Ok::<_, HandlerError>(Value::Null)
            }),
        );
        registry.register(panicking, false).unwrap();

        let err = registry.call("demo:panic", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        registry.register(add_tool(), false).unwrap();
        assert!(registry.call("math:add", json!({"a": 1, "b": 1})).await.is_ok());
    }

    #[test]
    fn long_causes_are_truncated() {
        let long = "x".repeat(1000);
        let cut = truncate(&long);
        assert_eq!(cut.chars().count(), MAX_FRAME_LEN);
        assert!(cut.ends_with('…'));
    }
}
