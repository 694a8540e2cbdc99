//! Plugin catalog: the named capability factories plugin files can select.
//!
//! A plugin file is declarative. It names a factory and passes it options;
//! the factory turns those into capability records. Factories are compiled
//! in, so reloading a file re-runs its factory with the file's new options.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::builtin::{CommandFactory, ConstantFactory, RouterFactory};
use super::errors::PluginError;
use crate::downstream::DownstreamManager;
use crate::registry::{CapabilityKind, CapabilityMap, Registry};

// ─── Descriptor ──────────────────────────────────────────────────────────────

/// Contents of one plugin file.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub factory: String,
    #[serde(default)]
    pub options: Value,
}

impl PluginDescriptor {
    /// Parse YAML (`.yaml`/`.yml`) or JSON (`.json`) by extension.
    pub fn parse(path: &Path, raw: &str) -> Result<Self, PluginError> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(raw).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(raw).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| PluginError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }
}

// ─── Factory contract ────────────────────────────────────────────────────────

/// Everything a factory may use while building capabilities.
pub struct FactoryContext<'a> {
    pub registry: &'a Arc<Registry>,
    pub downstream: &'a Arc<DownstreamManager>,
    /// Namespace of the directory the plugin file lives in.
    pub kind: CapabilityKind,
    pub options: &'a Value,
    pub source: &'a Path,
}

impl FactoryContext<'_> {
    /// Deserialize the plugin's `options` block.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        let options = match self.options {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(options).map_err(|e| self.error(format!("invalid options: {e}")))
    }

    /// A build failure attributed to this plugin file.
    pub fn error(&self, reason: impl Into<String>) -> PluginError {
        PluginError::Factory {
            path: self.source.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Builds the capability set for one plugin file.
pub trait CapabilityFactory: Send + Sync {
    /// Name plugin files use in their `factory:` field.
    fn name(&self) -> &'static str;

    fn build(&self, ctx: &FactoryContext<'_>) -> Result<CapabilityMap, PluginError>;
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<&'static str, Arc<dyn CapabilityFactory>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every built-in factory.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(RouterFactory);
        catalog.register(CommandFactory);
        catalog.register(ConstantFactory);
        catalog
    }

    pub fn register(&mut self, factory: impl CapabilityFactory + 'static) {
        self.factories.insert(factory.name(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("factories", &self.names())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
