//! Built-in modules.
//!
//! - `math` is stateless and provides arithmetic tools.
//! - `demo` is stateful: it counts calls, reports them through its status,
//!   and uses `math` when that module is present.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::modules::catalog::ModuleCatalog;
use crate::modules::lifecycle::{
    Module, ModuleContext, ModuleInstance, ModuleRuntime, RuntimeStatus,
};
use crate::modules::manifest::{ManifestSource, ModuleManifest};
use crate::registry::{handler_fn, HandlerError};

/// Entry reference of the `math` module.
pub const MATH_ENTRY: &str = "builtin:math";

/// Entry reference of the `demo` module.
pub const DEMO_ENTRY: &str = "builtin:demo";

/// Adds the built-in modules to a catalog.
pub fn register(catalog: &mut ModuleCatalog) {
    catalog.register(MATH_ENTRY, || Arc::new(MathModule) as Arc<dyn Module>);
    catalog.register(DEMO_ENTRY, || Arc::new(DemoModule) as Arc<dyn Module>);
}

/// Manifests of the built-in modules, used when no modules directory is configured.
#[must_use]
pub fn manifests() -> Vec<ManifestSource> {
    vec![
        ManifestSource::builtin(ModuleManifest {
            name: "math".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: Some("Arithmetic tools".to_string()),
            entry: MATH_ENTRY.to_string(),
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            load_order: 0,
            config: Map::new(),
        }),
        ManifestSource::builtin(ModuleManifest {
            name: "demo".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: Some("Echo and summation tools".to_string()),
            entry: DEMO_ENTRY.to_string(),
            dependencies: Vec::new(),
            optional_dependencies: vec!["math".to_string()],
            load_order: 10,
            config: Map::from_iter([("prefix".to_string(), json!(""))]),
        }),
    ]
}

fn binary_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "description": description,
        "properties": {
            "a": { "type": "number" },
            "b": { "type": "number" }
        },
        "required": ["a", "b"],
        "additionalProperties": false
    })
}

/// Integer arithmetic when both operands are integers and the result fits, float otherwise.
fn arithmetic(
    args: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, HandlerError> {
    let (a, b) = (&args["a"], &args["b"]);
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(result) = int_op(x, y) {
            return Ok(json!(result));
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(json!(float_op(x, y))),
        _ => Err("operands must be numbers".into()),
    }
}

struct MathModule;

#[async_trait]
impl Module for MathModule {
    async fn start(&self, ctx: ModuleContext) -> Result<ModuleInstance, HandlerError> {
        ctx.tools.register(
            "add",
            "Adds two numbers",
            binary_schema("Operands to add"),
            handler_fn(|args| async move { arithmetic(&args, i64::checked_add, |x, y| x + y) }),
        )?;
        ctx.tools.register(
            "multiply",
            "Multiplies two numbers",
            binary_schema("Operands to multiply"),
            handler_fn(|args| async move { arithmetic(&args, i64::checked_mul, |x, y| x * y) }),
        )?;
        debug!(module = %ctx.name, "Math tools registered");
        Ok(ModuleInstance::Stateless)
    }
}

struct DemoModule;

struct DemoRuntime {
    calls: Arc<AtomicU64>,
    math_available: bool,
}

#[async_trait]
impl ModuleRuntime for DemoRuntime {
    async fn stop(&mut self) -> Result<(), HandlerError> {
        info!(calls = self.calls.load(Ordering::Relaxed), "Demo module stopping");
        Ok(())
    }

    fn status(&self) -> RuntimeStatus {
        RuntimeStatus::with_detail(json!({
            "calls": self.calls.load(Ordering::Relaxed),
            "math": self.math_available,
        }))
    }
}

#[async_trait]
impl Module for DemoModule {
    async fn start(&self, ctx: ModuleContext) -> Result<ModuleInstance, HandlerError> {
        let calls = Arc::new(AtomicU64::new(0));
        let prefix = ctx.config_str("prefix").unwrap_or_default().to_string();
        let math = ctx.dependency("math").cloned();
        let math_available = math.is_some();

        let counter = Arc::clone(&calls);
        ctx.tools.register(
            "echo",
            "Returns the message, prefixed with the configured prefix",
            json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }),
            handler_fn(move |args| {
                let prefix = prefix.clone();
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    let message = args["message"].as_str().unwrap_or_default();
                    Ok::<_, HandlerError>(json!(format!("{prefix}{message}")))
                }
            }),
        )?;

        let counter = Arc::clone(&calls);
        ctx.tools.register(
            "sum",
            "Sums a list of numbers, through math:add when the math module is present",
            json!({
                "type": "object",
                "properties": {
                    "values": { "type": "array", "items": { "type": "number" } }
                },
                "required": ["values"]
            }),
            handler_fn(move |args| {
                let math = math.clone();
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    let values = args["values"].as_array().cloned().unwrap_or_default();
                    let Some(math) = math else {
                        let total: f64 = values.iter().filter_map(Value::as_f64).sum();
                        return Ok::<_, HandlerError>(json!({ "total": total, "via": "local" }));
                    };
                    let mut total = json!(0);
                    for value in values {
                        total = math
                            .call("add", json!({ "a": total, "b": value }))
                            .await?
                            .structured_content;
                    }
                    Ok::<_, HandlerError>(json!({ "total": total, "via": "math" }))
                }
            }),
        )?;

        debug!(module = %ctx.name, math = math_available, "Demo tools registered");
        Ok(ModuleInstance::Stateful(Box::new(DemoRuntime {
            calls,
            math_available,
        })))
    }
}
