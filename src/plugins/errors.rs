//! Plugin loading error types.

use thiserror::Error;

/// Errors raised while loading or reloading a plugin file.
///
/// The loader logs these per file and keeps going; a broken plugin simply
/// contributes no capabilities.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read plugin {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse plugin {path}: {reason}")]
    Parse { path: String, reason: String },

    /// The descriptor names a factory the catalog does not have.
    #[error("plugin {path} names unknown factory '{factory}'")]
    UnknownFactory { path: String, factory: String },

    /// The factory rejected its options or could not build capabilities.
    #[error("plugin {path} failed to build: {reason}")]
    Factory { path: String, reason: String },

    /// `reload_plugin` was given an identifier that matches no plugin file.
    #[error("unknown plugin: {id}")]
    UnknownPlugin { id: String },
}
