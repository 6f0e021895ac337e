//! Statically linked module entry points.
//!
//! A manifest's `entry` field names a factory registered here, for example
//! `builtin:math`. Resolving an entry calls the factory, so every resolution
//! (including the one a hot reload performs) yields a fresh module value.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::modules::builtin;
use crate::modules::lifecycle::Module;

/// Builds a module.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

/// Maps entry references to module factories.
#[derive(Default, Clone)]
pub struct ModuleCatalog {
    entries: BTreeMap<String, ModuleFactory>,
}

impl ModuleCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog containing the built-in modules.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        builtin::register(&mut catalog);
        catalog
    }

    /// Adds or replaces an entry.
    pub fn register<F>(&mut self, entry: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        self.entries.insert(entry.into(), Arc::new(factory));
    }

    /// Builds the module behind an entry reference.
    #[must_use]
    pub fn resolve(&self, entry: &str) -> Option<Arc<dyn Module>> {
        self.entries.get(entry).map(|factory| factory())
    }

    /// Returns `true` if the entry is known.
    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains_key(entry)
    }

    /// Lists the known entry references, sorted.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
