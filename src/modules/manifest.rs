//! Module manifests.
//!
//! Every module directory contains a `module.json` describing the module's
//! identity, its entry point and its dependencies:
//!
//! ```json
//! {
//!     "name": "demo",
//!     "version": "1.0.0",
//!     "description": "Echo tools",
//!     "entry": "builtin:demo",
//!     "dependencies": [],
//!     "optional_dependencies": ["math"],
//!     "load_order": 10,
//!     "config": { "greeting": "hello" }
//! }
//! ```
//!
//! Manifests are parsed once and are immutable afterwards. A malformed
//! manifest only fails its own module; discovery keeps going.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ModuleError;

/// File name of a module manifest inside its directory.
pub const MANIFEST_FILE: &str = "module.json";

static MODULE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]*$").expect("Invalid regex: module name pattern")
});

/// Declarative description of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleManifest {
    /// Module name; also the namespace of its tools.
    pub name: String,

    /// Module version.
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Entry reference resolved through the module catalog.
    pub entry: String,

    /// Modules that must be running before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Modules used when present.
    #[serde(default)]
    pub optional_dependencies: Vec<String>,

    /// Tie-break among modules the dependency order leaves unordered. Lower starts first.
    #[serde(default)]
    pub load_order: i32,

    /// Default configuration handed to the module on start.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ModuleManifest {
    /// Parses and validates a manifest from JSON text.
    ///
    /// `origin` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidManifest`] if the JSON is malformed or a
    /// required field is missing or invalid.
    pub fn from_json(json: &str, origin: &Path) -> Result<Self, ModuleError> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| ModuleError::InvalidManifest {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    /// Reads and validates a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidManifest`] if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ModuleError::InvalidManifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&contents, path)
    }

    /// Checks the required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidManifest`] describing the first problem found.
    pub fn validate(&self, origin: &Path) -> Result<(), ModuleError> {
        let invalid = |message: String| ModuleError::InvalidManifest {
            path: origin.to_path_buf(),
            message,
        };

        if !MODULE_NAME.is_match(&self.name) {
            return Err(invalid(format!(
                "module name '{}' must match [a-z][a-z0-9_-]*",
                self.name
            )));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty".to_string()));
        }
        if self.entry.trim().is_empty() {
            return Err(invalid("entry must not be empty".to_string()));
        }
        if let Some(dep) = self
            .dependencies
            .iter()
            .chain(&self.optional_dependencies)
            .find(|d| !MODULE_NAME.is_match(d))
        {
            return Err(invalid(format!("dependency name '{dep}' is invalid")));
        }
        if let Some(dep) = self
            .dependencies
            .iter()
            .find(|d| self.optional_dependencies.contains(d))
        {
            return Err(invalid(format!(
                "'{dep}' is listed as both a required and an optional dependency"
            )));
        }
        Ok(())
    }
}

/// A manifest together with the file it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSource {
    /// The parsed manifest.
    pub manifest: ModuleManifest,
    /// Location on disk, `None` for built-in modules.
    pub path: Option<PathBuf>,
}

impl ManifestSource {
    /// A manifest that did not come from disk.
    #[must_use]
    pub const fn builtin(manifest: ModuleManifest) -> Self {
        Self {
            manifest,
            path: None,
        }
    }
}

/// Result of scanning a modules directory.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Manifests that parsed and validated.
    pub manifests: Vec<ManifestSource>,
    /// Manifests that did not, one error each.
    pub errors: Vec<ModuleError>,
}

/// Reads every `<dir>/*/module.json`.
///
/// Each manifest is parsed independently: a malformed one is reported in
/// [`Discovery::errors`] and does not affect the others. Results are sorted by
/// path so discovery is deterministic.
#[must_use]
pub fn discover(dir: &Path) -> Discovery {
    let mut discovery = Discovery::default();
    let pattern = dir.join("*").join(MANIFEST_FILE);
    let pattern = pattern.to_string_lossy();

    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            discovery.errors.push(ModuleError::InvalidManifest {
                path: dir.to_path_buf(),
                message: format!("invalid modules directory pattern: {e}"),
            });
            return discovery;
        }
    };

    let mut found: Vec<PathBuf> = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => found.push(path),
            Err(e) => discovery.errors.push(ModuleError::InvalidManifest {
                path: e.path().to_path_buf(),
                message: e.error().to_string(),
            }),
        }
    }
    found.sort();

    for path in found {
        match ModuleManifest::from_file(&path) {
            Ok(manifest) => {
                debug!(module = %manifest.name, path = %path.display(), "Discovered module");
                discovery.manifests.push(ManifestSource {
                    manifest,
                    path: Some(path),
                });
            }
            Err(e) => {
                warn!(error = %e, "Skipping module with invalid manifest");
                discovery.errors.push(e);
            }
        }
    }

    discovery
}
