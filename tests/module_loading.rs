//! Integration tests for module discovery, dependency resolution and lifecycle.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mcp_plugin_host::error::ModuleError;
use mcp_plugin_host::modules::graph::resolve;
use mcp_plugin_host::modules::{
    builtin, LoaderSettings, Module, ModuleCatalog, ModuleContext, ModuleInstance, ModuleLoader,
    ModuleManifest, ModuleState, StaticConfigProvider,
};
use mcp_plugin_host::registry::{handler_fn, HandlerError, ToolRegistry};
use mcp_plugin_host::telemetry::RecordingTelemetry;
use serde_json::{json, Map, Value};

fn manifest(name: &str, deps: &[&str], load_order: i32) -> ModuleManifest {
    ModuleManifest {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        description: None,
        entry: builtin::MATH_ENTRY.to_string(),
        dependencies: deps.iter().map(ToString::to_string).collect(),
        optional_dependencies: Vec::new(),
        load_order,
        config: Map::new(),
    }
}

fn write_manifest(dir: &Path, module: &str, manifest: &Value) {
    let module_dir = dir.join(module);
    fs::create_dir_all(&module_dir).unwrap();
    fs::write(module_dir.join("module.json"), manifest.to_string()).unwrap();
}

/// Calls `math:add` through its dependency handle.
struct Doubler;

#[async_trait]
impl Module for Doubler {
    async fn start(&self, ctx: ModuleContext) -> Result<ModuleInstance, HandlerError> {
        let math = ctx
            .dependency("math")
            .cloned()
            .ok_or("math dependency missing")?;
        ctx.tools.register(
            "double",
            "Doubles a number using math:add",
            json!({
                "type": "object",
                "properties": { "x": { "type": "number" } },
                "required": ["x"]
            }),
            handler_fn(move |args| {
                let math = math.clone();
                async move {
                    let x = args["x"].clone();
                    let sum = math.call("add", json!({ "a": x, "b": x })).await?;
                    Ok::<_, HandlerError>(sum.structured_content)
                }
            }),
        )?;
        Ok(ModuleInstance::Stateless)
    }
}

fn loader_with(telemetry: Arc<RecordingTelemetry>, overrides: HashMap<String, Map<String, Value>>) -> ModuleLoader {
    let mut catalog = ModuleCatalog::with_builtins();
    catalog.register("test:doubler", || Arc::new(Doubler) as Arc<dyn Module>);
    ModuleLoader::new(
        catalog,
        Arc::new(ToolRegistry::default()),
        Arc::new(StaticConfigProvider::new(overrides)),
        telemetry,
        LoaderSettings::default(),
    )
}

fn loader() -> ModuleLoader {
    loader_with(RecordingTelemetry::new(), HashMap::new())
}

// =============================================================================
// Dependency Resolution Tests
// =============================================================================

#[test]
fn test_dependencies_precede_dependents_for_any_input_order() {
    let manifests = vec![
        manifest("db", &[], 5),
        manifest("cache", &["db"], 0),
        manifest("api", &["db", "cache"], 0),
        manifest("web", &["api"], -3),
        manifest("metrics", &[], 1),
        manifest("auth", &["db"], 2),
    ];

    let mut orders = HashSet::new();
    for rotation in 0..manifests.len() {
        for reversed in [false, true] {
            let mut input = manifests.clone();
            input.rotate_left(rotation);
            if reversed {
                input.reverse();
            }

            let resolution = resolve(&input);
            assert!(resolution.failed.is_empty());
            let position = |name: &str| resolution.order.iter().position(|n| n == name).unwrap();
            for m in &manifests {
                for dep in &m.dependencies {
                    assert!(position(dep) < position(&m.name), "{dep} must precede {}", m.name);
                }
            }
            orders.insert(resolution.order);
        }
    }

    assert_eq!(orders.len(), 1, "resolution must not depend on input order");
}

#[test]
fn test_cycles_fail_only_the_affected_modules() {
    let resolution = resolve(&[
        manifest("a", &["b"], 0),
        manifest("b", &["a"], 0),
        manifest("c", &["a"], 0),
        manifest("d", &[], 0),
    ]);

    assert_eq!(resolution.order, vec!["d".to_string()]);
    match resolution.failure("a") {
        Some(ModuleError::CircularDependency { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"a".to_string()) && cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(matches!(
        resolution.failure("b"),
        Some(ModuleError::CircularDependency { .. })
    ));
    assert!(matches!(
        resolution.failure("c"),
        Some(ModuleError::DependencyFailed { dependency, .. }) if dependency == "a"
    ));
}

// =============================================================================
// Loader Tests
// =============================================================================

#[tokio::test]
async fn test_missing_required_dependency_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "x",
        &json!({ "name": "x", "version": "1.0.0", "entry": "builtin:demo", "dependencies": ["y"] }),
    );
    let loader = loader();

    let summary = loader.load_directory(dir.path()).await;

    assert!(summary.succeeded.is_empty());
    assert_eq!(
        summary.failed,
        vec![(
            "x".to_string(),
            ModuleError::MissingDependency {
                module: "x".to_string(),
                dependency: "y".to_string(),
            }
        )]
    );
    assert_eq!(loader.status("x").unwrap().state, ModuleState::Failed);
    assert!(loader.registry().is_empty());
}

#[tokio::test]
async fn test_directory_load_survives_broken_manifest() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "math",
        &json!({ "name": "math", "version": "1.0.0", "entry": "builtin:math" }),
    );
    write_manifest(
        dir.path(),
        "doubler",
        &json!({
            "name": "doubler",
            "version": "0.2.0",
            "entry": "test:doubler",
            "dependencies": ["math"]
        }),
    );
    let broken = dir.path().join("broken");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("module.json"), "{ \"name\": ").unwrap();
    let loader = loader();

    let summary = loader.load_directory(dir.path()).await;

    assert_eq!(summary.succeeded, vec!["math".to_string(), "doubler".to_string()]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "broken");
    assert!(summary.check_required(&["math".to_string(), "doubler".to_string()]).is_ok());
    assert!(summary.check_required(&["broken".to_string()]).is_err());

    let result = loader
        .registry()
        .call("doubler:double", json!({ "x": 21 }))
        .await
        .unwrap();
    assert_eq!(result.structured_content, json!(42));
}

#[tokio::test]
async fn test_hot_reload_rereads_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let demo = |prefix: &str| {
        json!({
            "name": "demo",
            "version": "1.0.0",
            "entry": "builtin:demo",
            "config": { "prefix": prefix }
        })
    };
    write_manifest(dir.path(), "demo", &demo("v1: "));
    let telemetry = RecordingTelemetry::new();
    let loader = loader_with(Arc::clone(&telemetry), HashMap::new());
    loader.load_directory(dir.path()).await;

    let echo = |loader: &ModuleLoader| {
        let registry = Arc::clone(loader.registry());
        async move {
            registry
                .call("demo:echo", json!({ "message": "hi" }))
                .await
                .unwrap()
                .structured_content
        }
    };
    assert_eq!(echo(&loader).await, json!("v1: hi"));

    write_manifest(dir.path(), "demo", &demo("v2: "));
    assert_eq!(loader.reload("demo").await.unwrap(), ModuleState::Running);

    assert_eq!(echo(&loader).await, json!("v2: hi"));
    assert_eq!(telemetry.named("module.reloaded").len(), 1);
    assert!(matches!(
        loader.reload("ghost").await,
        Err(ModuleError::NotLoaded { .. })
    ));
}

#[tokio::test]
async fn test_configured_overrides_win_over_manifest_defaults() {
    let overrides = HashMap::from([(
        "demo".to_string(),
        Map::from_iter([("prefix".to_string(), json!("[cfg] "))]),
    )]);
    let loader = loader_with(RecordingTelemetry::new(), overrides);
    loader.load_all(builtin::manifests()).await;

    let result = loader
        .registry()
        .call("demo:echo", json!({ "message": "x" }))
        .await
        .unwrap();
    assert_eq!(result.structured_content, json!("[cfg] x"));
}

#[tokio::test]
async fn test_stop_all_unregisters_every_tool() {
    let telemetry = RecordingTelemetry::new();
    let loader = loader_with(Arc::clone(&telemetry), HashMap::new());
    let summary = loader.load_all(builtin::manifests()).await;
    assert_eq!(summary.succeeded, vec!["math".to_string(), "demo".to_string()]);

    assert!(loader.stop_all().await.is_empty());

    assert!(loader.registry().is_empty());
    assert!(loader.running().is_empty());
    let stopped: Vec<Value> = telemetry
        .named("module.stopped")
        .into_iter()
        .map(|data| data["module"].clone())
        .collect();
    assert_eq!(stopped, vec![json!("demo"), json!("math")]);
}
