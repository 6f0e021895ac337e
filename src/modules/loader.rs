//! Module loader.
//!
//! Owns every loaded module and drives its lifecycle:
//!
//! ```text
//! stopped -> starting -> running | failed
//! running -> stopping -> stopped
//! running -> degraded            (reported by the module's status)
//! ```
//!
//! Lifecycle operations are serialised by one async mutex, so only one
//! load, start, stop or reload runs at a time. Start and stop run on their
//! own task under a timeout; a module that hangs is abandoned and marked
//! `failed` (start) or `stopped` (stop). Errors are returned as values so a
//! batch load degrades instead of aborting.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::ModuleError;
use crate::modules::catalog::ModuleCatalog;
use crate::modules::graph::DependencyGraph;
use crate::modules::lifecycle::{
    DependencyHandle, Module, ModuleContext, ModuleHealth, ModuleInstance, ModuleRuntime,
    ModuleState, ToolRegistrar,
};
use crate::modules::manifest::{self, ManifestSource, ModuleManifest};
use crate::registry::{panic_message, ToolRegistry};
use crate::telemetry::Telemetry;

/// Default time budget for a module's start.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time budget for a module's stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    /// Bound on a module's `start`.
    pub start_timeout: Duration,
    /// Bound on a module's `stop`.
    pub stop_timeout: Duration,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Supplies the configuration a module starts with.
pub trait ModuleConfigProvider: Send + Sync {
    /// Returns the merged configuration for a module.
    fn config_for(&self, manifest: &ModuleManifest) -> Map<String, Value>;
}

/// Shallow-merges per-module overrides over manifest defaults.
#[derive(Debug, Default, Clone)]
pub struct StaticConfigProvider {
    overrides: HashMap<String, Map<String, Value>>,
}

impl StaticConfigProvider {
    /// Creates a provider from per-module overrides.
    #[must_use]
    pub const fn new(overrides: HashMap<String, Map<String, Value>>) -> Self {
        Self { overrides }
    }
}

impl ModuleConfigProvider for StaticConfigProvider {
    fn config_for(&self, manifest: &ModuleManifest) -> Map<String, Value> {
        let mut merged = manifest.config.clone();
        if let Some(overrides) = self.overrides.get(&manifest.name) {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Outcome of a batch load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    /// Modules that are running, in start order.
    pub succeeded: Vec<String>,
    /// Modules that are not, with the reason.
    pub failed: Vec<(String, ModuleError)>,
}

impl LoadSummary {
    /// Returns `true` if every module started.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Checks that every module in `required` started.
    ///
    /// # Errors
    ///
    /// Returns the failure of the first required module that did not start,
    /// or [`ModuleError::NotLoaded`] if it was never part of the batch.
    pub fn check_required(&self, required: &[String]) -> Result<(), ModuleError> {
        for name in required {
            if let Some((_, error)) = self.failed.iter().find(|(n, _)| n == name) {
                return Err(error.clone());
            }
            if !self.succeeded.contains(name) {
                return Err(ModuleError::NotLoaded {
                    module: name.clone(),
                });
            }
        }
        Ok(())
    }
}

struct ModuleSlot {
    source: ManifestSource,
    /// `None` when the entry reference could not be resolved.
    module: Option<Arc<dyn Module>>,
    state: ModuleState,
    runtime: Option<Box<dyn ModuleRuntime>>,
    last_error: Option<ModuleError>,
}

impl ModuleSlot {
    fn failed(source: ManifestSource, error: ModuleError) -> Self {
        Self {
            source,
            module: None,
            state: ModuleState::Failed,
            runtime: None,
            last_error: Some(error),
        }
    }
}

#[derive(Default)]
struct LoaderState {
    slots: IndexMap<String, ModuleSlot>,
    /// Active modules in the order they started.
    started: Vec<String>,
}

/// Loads, starts, stops and reloads modules.
pub struct ModuleLoader {
    catalog: ModuleCatalog,
    registry: Arc<ToolRegistry>,
    config: Arc<dyn ModuleConfigProvider>,
    telemetry: Arc<dyn Telemetry>,
    settings: LoaderSettings,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<LoaderState>,
}

impl ModuleLoader {
    /// Creates a loader with no modules.
    pub fn new(
        catalog: ModuleCatalog,
        registry: Arc<ToolRegistry>,
        config: Arc<dyn ModuleConfigProvider>,
        telemetry: Arc<dyn Telemetry>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            catalog,
            registry,
            config,
            telemetry,
            settings,
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(LoaderState::default()),
        }
    }

    /// The registry modules register their tools in.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Resolves a module's entry point without starting it.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Duplicate`] if a module with that name is
    /// already loaded, or [`ModuleError::UnknownEntry`] if the entry reference
    /// is not in the catalog (the module is then recorded as failed).
    pub async fn load(&self, source: ManifestSource) -> Result<(), ModuleError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.load_locked(source)
    }

    /// Starts a loaded module.
    ///
    /// Starting an active module is a no-op that returns its state.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::NotLoaded`], a dependency error, or the start
    /// failure. On failure the module is marked failed and any tools it
    /// registered are removed.
    pub async fn start(&self, name: &str) -> Result<ModuleState, ModuleError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked(name).await
    }

    /// Stops a module and removes its tools.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::NotLoaded`], or [`ModuleError::StopTimeout`] if
    /// the module did not stop in time; it is marked stopped regardless.
    pub async fn stop(&self, name: &str) -> Result<(), ModuleError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked(name).await
    }

    /// Loads and starts a batch of modules in dependency order.
    ///
    /// Individual failures do not stop the batch.
    pub async fn load_all(&self, sources: Vec<ManifestSource>) -> LoadSummary {
        let _lifecycle = self.lifecycle.lock().await;
        let mut summary = LoadSummary::default();

        let mut fresh = Vec::new();
        let available: HashSet<String> = {
            let state = self.state.lock();
            for source in sources {
                let name = source.manifest.name.clone();
                if state.slots.contains_key(&name) {
                    summary
                        .failed
                        .push((name.clone(), ModuleError::Duplicate { module: name }));
                } else {
                    fresh.push(source);
                }
            }
            state
                .slots
                .iter()
                .filter(|(_, slot)| slot.state.is_active())
                .map(|(name, _)| name.clone())
                .collect()
        };

        let resolution =
            DependencyGraph::new(fresh.iter().map(|s| &s.manifest)).resolve(&available);

        let mut by_name: HashMap<String, ManifestSource> = HashMap::new();
        for source in fresh {
            by_name
                .entry(source.manifest.name.clone())
                .or_insert(source);
        }

        for (name, error) in resolution.failed {
            if !matches!(error, ModuleError::Duplicate { .. }) {
                if let Some(source) = by_name.remove(&name) {
                    self.state
                        .lock()
                        .slots
                        .insert(name.clone(), ModuleSlot::failed(source, error.clone()));
                }
            }
            self.report_failure(&name, &error);
            summary.failed.push((name, error));
        }

        for name in resolution.order {
            let Some(source) = by_name.remove(&name) else {
                continue;
            };
            let started = match self.load_locked(source) {
                Ok(()) => self.start_locked(&name).await.map(|_| ()),
                Err(error) => Err(error),
            };
            match started {
                Ok(()) => summary.succeeded.push(name),
                Err(error) => summary.failed.push((name, error)),
            }
        }

        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "Module batch loaded"
        );
        summary
    }

    /// Discovers the manifests in `dir` and loads them as one batch.
    ///
    /// Manifests that fail to parse are reported under their directory name.
    pub async fn load_directory(&self, dir: &Path) -> LoadSummary {
        let discovery = manifest::discover(dir);
        let mut summary = self.load_all(discovery.manifests).await;
        for error in discovery.errors {
            let name = match &error {
                ModuleError::InvalidManifest { path, .. } => path
                    .parent()
                    .and_then(Path::file_name)
                    .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
                other => other.to_string(),
            };
            self.report_failure(&name, &error);
            summary.failed.push((name, error));
        }
        summary
    }

    /// Stops a module if it is running, re-reads its manifest (when it came
    /// from disk), re-resolves its entry point and starts it again.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::NotLoaded`], an invalid-manifest or entry error,
    /// or the start failure.
    pub async fn reload(&self, name: &str) -> Result<ModuleState, ModuleError> {
        let _lifecycle = self.lifecycle.lock().await;

        let source = self
            .state
            .lock()
            .slots
            .get(name)
            .map(|slot| slot.source.clone())
            .ok_or_else(|| ModuleError::NotLoaded {
                module: name.to_string(),
            })?;

        if let Err(error) = self.stop_locked(name).await {
            warn!(module = %name, error = %error, "Continuing reload after stop timeout");
        }

        let manifest = match &source.path {
            Some(path) => ModuleManifest::from_file(path).and_then(|m| {
                if m.name == name {
                    Ok(m)
                } else {
                    Err(ModuleError::InvalidManifest {
                        path: path.clone(),
                        message: format!("module name changed from '{name}' to '{}'", m.name),
                    })
                }
            }),
            None => Ok(source.manifest.clone()),
        };
        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(error) => {
                self.mark_failed(name, error.clone());
                self.report_failure(name, &error);
                return Err(error);
            }
        };

        let module = self.resolve_entry(&manifest);
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(name) {
                slot.source.manifest = manifest.clone();
                slot.module = module.as_ref().ok().cloned();
                slot.state = ModuleState::Stopped;
            }
        }
        if let Err(error) = module {
            self.mark_failed(name, error.clone());
            self.report_failure(name, &error);
            return Err(error);
        }

        let state = self.start_locked(name).await?;
        info!(module = %name, version = %manifest.version, "Module reloaded");
        self.telemetry.event(
            "module.reloaded",
            json!({ "module": name, "version": manifest.version }),
        );
        Ok(state)
    }

    /// Stops every active module in reverse start order.
    ///
    /// Returns the stop timeouts that occurred; every module ends up stopped.
    pub async fn stop_all(&self) -> Vec<ModuleError> {
        let _lifecycle = self.lifecycle.lock().await;
        let order: Vec<String> = self.state.lock().started.iter().rev().cloned().collect();

        let mut errors = Vec::new();
        for name in order {
            if let Err(error) = self.stop_locked(&name).await {
                errors.push(error);
            }
        }
        errors
    }

    /// Returns the health descriptor of one module.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<ModuleHealth> {
        let mut state = self.state.lock();
        state
            .slots
            .get_mut(name)
            .map(|slot| self.health(name, slot))
    }

    /// Returns the health descriptors of all loaded modules.
    #[must_use]
    pub fn statuses(&self) -> Vec<ModuleHealth> {
        let mut state = self.state.lock();
        state
            .slots
            .iter_mut()
            .map(|(name, slot)| self.health(name, slot))
            .collect()
    }

    /// Names of the active modules in start order.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    /// Queries a module's runtime and refreshes `running` / `degraded`.
    fn health(&self, name: &str, slot: &mut ModuleSlot) -> ModuleHealth {
        let mut detail = None;
        if let (Some(runtime), true) = (&slot.runtime, slot.state.is_active()) {
            let status = runtime.status();
            let next = if status.degraded {
                ModuleState::Degraded
            } else {
                ModuleState::Running
            };
            if next != slot.state {
                info!(module = %name, from = %slot.state, to = %next, "Module health changed");
                slot.state = next;
            }
            detail = status.detail;
        }

        ModuleHealth {
            name: name.to_string(),
            version: slot.source.manifest.version.clone(),
            state: slot.state,
            detail,
            tools: self.registry.names_owned_by(name),
            last_error: slot.last_error.as_ref().map(ToString::to_string),
        }
    }

    fn resolve_entry(&self, manifest: &ModuleManifest) -> Result<Arc<dyn Module>, ModuleError> {
        self.catalog
            .resolve(&manifest.entry)
            .ok_or_else(|| ModuleError::UnknownEntry {
                module: manifest.name.clone(),
                entry: manifest.entry.clone(),
            })
    }

    fn load_locked(&self, source: ManifestSource) -> Result<(), ModuleError> {
        let name = source.manifest.name.clone();
        let mut state = self.state.lock();
        if state.slots.contains_key(&name) {
            return Err(ModuleError::Duplicate { module: name });
        }

        match self.resolve_entry(&source.manifest) {
            Ok(module) => {
                debug!(module = %name, entry = %source.manifest.entry, "Module loaded");
                state.slots.insert(
                    name,
                    ModuleSlot {
                        source,
                        module: Some(module),
                        state: ModuleState::Stopped,
                        runtime: None,
                        last_error: None,
                    },
                );
                Ok(())
            }
            Err(error) => {
                state
                    .slots
                    .insert(name.clone(), ModuleSlot::failed(source, error.clone()));
                drop(state);
                self.report_failure(&name, &error);
                Err(error)
            }
        }
    }

    /// Builds the dependency map handed to a starting module.
    fn dependency_handles(
        &self,
        manifest: &ModuleManifest,
    ) -> Result<BTreeMap<String, Option<DependencyHandle>>, ModuleError> {
        let state = self.state.lock();
        let handle = |name: &str| {
            state
                .slots
                .get(name)
                .filter(|slot| slot.state.is_active())
                .map(|slot| {
                    DependencyHandle::new(
                        name.to_string(),
                        slot.source.manifest.version.clone(),
                        Arc::clone(&self.registry),
                    )
                })
        };

        let mut handles = BTreeMap::new();
        for dep in &manifest.dependencies {
            let Some(found) = handle(dep) else {
                return Err(if state.slots.contains_key(dep) {
                    ModuleError::DependencyFailed {
                        module: manifest.name.clone(),
                        dependency: dep.clone(),
                    }
                } else {
                    ModuleError::MissingDependency {
                        module: manifest.name.clone(),
                        dependency: dep.clone(),
                    }
                });
            };
            handles.insert(dep.clone(), Some(found));
        }
        for dep in &manifest.optional_dependencies {
            handles.insert(dep.clone(), handle(dep));
        }
        Ok(handles)
    }

    async fn start_locked(&self, name: &str) -> Result<ModuleState, ModuleError> {
        let (module, manifest) = {
            let state = self.state.lock();
            let slot = state.slots.get(name).ok_or_else(|| ModuleError::NotLoaded {
                module: name.to_string(),
            })?;
            if slot.state.is_active() {
                return Ok(slot.state);
            }
            let Some(module) = slot.module.clone() else {
                return Err(slot.last_error.clone().unwrap_or_else(|| {
                    ModuleError::UnknownEntry {
                        module: name.to_string(),
                        entry: slot.source.manifest.entry.clone(),
                    }
                }));
            };
            (module, slot.source.manifest.clone())
        };

        let dependencies = match self.dependency_handles(&manifest) {
            Ok(dependencies) => dependencies,
            Err(error) => {
                self.mark_failed(name, error.clone());
                self.report_failure(name, &error);
                return Err(error);
            }
        };
        for (dep, handle) in &dependencies {
            if handle.is_none() {
                warn!(module = %name, dependency = %dep, "Optional dependency missing");
                self.telemetry.event(
                    "module.optional_dependency_missing",
                    json!({ "module": name, "dependency": dep }),
                );
            }
        }

        self.set_state(name, ModuleState::Starting);
        let ctx = ModuleContext {
            name: name.to_string(),
            config: self.config.config_for(&manifest),
            dependencies,
            tools: ToolRegistrar::new(name.to_string(), Arc::clone(&self.registry)),
        };

        let timeout = self.settings.start_timeout;
        let mut task = tokio::spawn(async move { module.start(ctx).await });
        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Err(_) => {
                task.abort();
                Err(ModuleError::StartTimeout {
                    module: name.to_string(),
                    timeout,
                })
            }
            Ok(Err(join_error)) => Err(ModuleError::StartFailed {
                module: name.to_string(),
                message: if join_error.is_panic() {
                    format!("panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "start was cancelled".to_string()
                },
            }),
            Ok(Ok(Err(error))) => Err(ModuleError::StartFailed {
                module: name.to_string(),
                message: error.to_string(),
            }),
            Ok(Ok(Ok(instance))) => Ok(instance),
        };

        match outcome {
            Ok(instance) => {
                let runtime = match instance {
                    ModuleInstance::Stateless => None,
                    ModuleInstance::Stateful(runtime) => Some(runtime),
                };
                {
                    let mut state = self.state.lock();
                    if let Some(slot) = state.slots.get_mut(name) {
                        slot.state = ModuleState::Running;
                        slot.runtime = runtime;
                        slot.last_error = None;
                    }
                    state.started.retain(|n| n != name);
                    state.started.push(name.to_string());
                }
                let tools = self.registry.names_owned_by(name);
                info!(module = %name, version = %manifest.version, tools = tools.len(), "Module started");
                self.telemetry.event(
                    "module.started",
                    json!({ "module": name, "version": manifest.version, "tools": tools }),
                );
                Ok(ModuleState::Running)
            }
            Err(error) => {
                let removed = self.registry.unregister_owner(name);
                if !removed.is_empty() {
                    debug!(module = %name, tools = ?removed, "Removed tools of failed module");
                }
                self.mark_failed(name, error.clone());
                self.report_failure(name, &error);
                Err(error)
            }
        }
    }

    async fn stop_locked(&self, name: &str) -> Result<(), ModuleError> {
        let runtime = {
            let mut state = self.state.lock();
            let slot = state
                .slots
                .get_mut(name)
                .ok_or_else(|| ModuleError::NotLoaded {
                    module: name.to_string(),
                })?;
            if !slot.state.is_active() {
                return Ok(());
            }
            slot.state = ModuleState::Stopping;
            slot.runtime.take()
        };

        let removed = self.registry.unregister_owner(name);

        let timeout = self.settings.stop_timeout;
        let result = match runtime {
            None => Ok(()),
            Some(mut runtime) => {
                let mut task = tokio::spawn(async move { runtime.stop().await });
                match tokio::time::timeout(timeout, &mut task).await {
                    Err(_) => {
                        task.abort();
                        Err(ModuleError::StopTimeout {
                            module: name.to_string(),
                            timeout,
                        })
                    }
                    Ok(Err(join_error)) => {
                        warn!(module = %name, error = %join_error, "Module stop aborted");
                        Ok(())
                    }
                    Ok(Ok(Err(error))) => {
                        warn!(module = %name, error = %error, "Module reported an error while stopping");
                        Ok(())
                    }
                    Ok(Ok(Ok(()))) => Ok(()),
                }
            }
        };

        {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(name) {
                slot.state = ModuleState::Stopped;
                if let Err(error) = &result {
                    slot.last_error = Some(error.clone());
                }
            }
            state.started.retain(|n| n != name);
        }

        match &result {
            Ok(()) => {
                info!(module = %name, "Module stopped");
                self.telemetry
                    .event("module.stopped", json!({ "module": name, "tools": removed }));
            }
            Err(error) => {
                warn!(module = %name, timeout = ?timeout, "Module did not stop in time; marked stopped");
                self.telemetry.event(
                    "module.stop_timeout",
                    json!({ "module": name, "error": error.to_string() }),
                );
            }
        }
        result
    }

    fn set_state(&self, name: &str, next: ModuleState) {
        if let Some(slot) = self.state.lock().slots.get_mut(name) {
            slot.state = next;
        }
    }

    fn mark_failed(&self, name: &str, error: ModuleError) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(name) {
            slot.state = ModuleState::Failed;
            slot.runtime = None;
            slot.last_error = Some(error);
        }
        state.started.retain(|n| n != name);
    }

    fn report_failure(&self, name: &str, error: &ModuleError) {
        warn!(module = %name, error = %error, "Module failed");
        self.telemetry.event(
            "module.start_failed",
            json!({ "module": name, "kind": error.kind().as_str(), "error": error.to_string() }),
        );
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("catalog", &self.catalog)
            .field("settings", &self.settings)
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}
