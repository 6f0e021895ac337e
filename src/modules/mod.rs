//! Modules: manifests, dependency resolution and lifecycle.
//!
//! A module bundles tools under one namespace. Its manifest names an entry
//! point in the [`ModuleCatalog`]; the [`ModuleLoader`] orders modules by
//! their dependencies, starts them, and keeps their health.

pub mod builtin;
pub mod catalog;
pub mod graph;
pub mod lifecycle;
pub mod loader;
pub mod manifest;

pub use catalog::{ModuleCatalog, ModuleFactory};
pub use graph::{DependencyGraph, Resolution};
pub use lifecycle::{
    DependencyHandle, Module, ModuleContext, ModuleHealth, ModuleInstance, ModuleRuntime,
    ModuleState, RuntimeStatus, ToolRegistrar,
};
pub use loader::{
    LoadSummary, LoaderSettings, ModuleConfigProvider, ModuleLoader, StaticConfigProvider,
};
pub use manifest::{discover, Discovery, ManifestSource, ModuleManifest};
