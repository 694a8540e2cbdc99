//! Plugin system: declarative plugin files, a catalog of factories, and a
//! polling loader with hot reload.
//!
//! This module handles:
//! - Parsing plugin descriptors (`factory` + `options`) from YAML or JSON
//! - Building capabilities through the named factory
//! - Tracking which capabilities each file contributed, for clean reloads

pub mod builtin;
pub mod catalog;
pub mod errors;
pub mod loader;

pub use catalog::{CapabilityFactory, FactoryContext, PluginCatalog, PluginDescriptor};
pub use errors::PluginError;
pub use loader::{DynamicLoader, LoadedPlugin};
