//! Dynamic plugin loading with hot reload.
//!
//! Scans the tools/resources/agents directories for plugin files, runs the
//! factory each file names, and registers the result. A file's current
//! capability set is its *generation*; reloading swaps generations in one
//! registry write so readers never see a mix.
//!
//! Skips files whose names start with `_` or `.` and files that are not
//! `.yaml`, `.yml`, or `.json`. Deleted files are not detected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::catalog::{FactoryContext, PluginCatalog, PluginDescriptor};
use super::errors::PluginError;
use crate::config::PluginsConfig;
use crate::downstream::DownstreamManager;
use crate::registry::{CapabilityKind, CapabilityMap, EntryKey, Registry};

const PLUGIN_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

// ─── Public Types ────────────────────────────────────────────────────────────

/// What one plugin file most recently contributed.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedPlugin {
    pub path: PathBuf,
    pub kind: CapabilityKind,
    /// Factory named by the file; `None` when the file did not parse.
    pub factory: Option<String>,
    /// Capability names in the current generation.
    pub capabilities: Vec<String>,
    /// File modification time seen at the last (re)load.
    pub modified: Option<DateTime<Utc>>,
    pub loaded_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip)]
    keys: Vec<EntryKey>,
}

impl LoadedPlugin {
    pub fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }
}

// ─── Loader ──────────────────────────────────────────────────────────────────

pub struct DynamicLoader {
    registry: Arc<Registry>,
    downstream: Arc<DownstreamManager>,
    catalog: PluginCatalog,
    dirs: Vec<(CapabilityKind, PathBuf)>,
    plugins: Mutex<BTreeMap<PathBuf, LoadedPlugin>>,
}

impl DynamicLoader {
    pub fn new(
        registry: Arc<Registry>,
        downstream: Arc<DownstreamManager>,
        catalog: PluginCatalog,
        config: &PluginsConfig,
    ) -> Self {
        Self {
            registry,
            downstream,
            catalog,
            dirs: vec![
                (CapabilityKind::Tool, config.tools_dir.clone()),
                (CapabilityKind::Resource, config.resources_dir.clone()),
                (CapabilityKind::Agent, config.agents_dir.clone()),
            ],
            plugins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Directories scanned, with the namespace each feeds.
    pub fn directories(&self) -> &[(CapabilityKind, PathBuf)] {
        &self.dirs
    }

    /// Initial full scan: load every plugin file found.
    ///
    /// Returns the number of capabilities registered.
    pub fn load_components(&self) -> usize {
        let mut plugins = self.plugins.lock();
        let mut total = 0;
        for (kind, dir) in &self.dirs {
            let Some(files) = scan_dir(*kind, dir, true) else {
                continue;
            };
            for path in files {
                total += self.load_file(&mut plugins, *kind, &path).capabilities.len();
            }
        }
        tracing::info!(
            plugins = plugins.len(),
            capabilities = total,
            "plugin components loaded"
        );
        total
    }

    /// One poll cycle: load new files and reload files whose modification
    /// time advanced.
    ///
    /// Returns the paths that were (re)loaded.
    pub fn check_and_reload(&self) -> Vec<PathBuf> {
        let mut plugins = self.plugins.lock();
        let mut touched = Vec::new();
        for (kind, dir) in &self.dirs {
            let Some(files) = scan_dir(*kind, dir, false) else {
                continue;
            };
            for path in files {
                let modified = modified_time(&path);
                match plugins.get(&path) {
                    None => {
                        tracing::info!(kind = %kind, path = %path.display(), "new plugin file detected");
                    }
                    Some(record) if is_newer(modified, record.modified) => {
                        tracing::info!(kind = %kind, path = %path.display(), "plugin file modified, reloading");
                    }
                    Some(_) => continue,
                }
                self.load_file(&mut plugins, *kind, &path);
                touched.push(path);
            }
        }
        touched
    }

    /// Reload one plugin now, regardless of its modification time.
    ///
    /// `id` is the file path, or a file name / stem when that is unambiguous.
    /// A file that exists in a plugin directory but was never loaded is
    /// loaded.
    pub fn reload_plugin(&self, id: &str) -> Result<LoadedPlugin, PluginError> {
        let mut plugins = self.plugins.lock();
        let (kind, path) = self.resolve_id(&plugins, id)?;
        tracing::info!(kind = %kind, path = %path.display(), "explicit plugin reload");
        let record = self.load_file(&mut plugins, kind, &path).clone();
        match &record.last_error {
            Some(reason) => Err(PluginError::Factory {
                path: path.display().to_string(),
                reason: reason.clone(),
            }),
            None => Ok(record),
        }
    }

    /// Snapshot of every plugin record, ordered by path.
    pub fn loaded_plugins(&self) -> Vec<LoadedPlugin> {
        self.plugins.lock().values().cloned().collect()
    }

    /// Spawn the hot-reload loop polling every `interval`.
    pub fn watch(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let loader = Arc::clone(self);
        tracing::info!(interval_ms = interval.as_millis() as u64, "plugin hot reload enabled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reloaded = loader.check_and_reload();
                if !reloaded.is_empty() {
                    tracing::debug!(count = reloaded.len(), "plugin poll cycle reloaded files");
                }
            }
        })
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// (Re)load one file and store its record. Never fails: errors are
    /// logged and recorded, and the broken file's generation becomes empty.
    fn load_file<'a>(
        &self,
        plugins: &'a mut BTreeMap<PathBuf, LoadedPlugin>,
        kind: CapabilityKind,
        path: &Path,
    ) -> &'a LoadedPlugin {
        // Recorded even on failure so a broken file is retried only when it
        // changes again.
        let modified = modified_time(path);
        let previous = plugins
            .get(path)
            .map(|p| p.keys.clone())
            .unwrap_or_default();

        let (factory, built) = self.build(kind, path);
        let (capabilities, last_error) = match built {
            Ok(map) => (map, None),
            Err(e) => {
                tracing::error!(kind = %kind, path = %path.display(), error = %e, "plugin load failed");
                (CapabilityMap::new(), Some(e.to_string()))
            }
        };

        let keys = self
            .registry
            .replace_generation(&previous, capabilities.into_values());
        for (k, name) in &keys {
            tracing::info!(kind = %k, name = %name, path = %path.display(), "loaded capability");
        }
        if !previous.is_empty() {
            tracing::debug!(
                path = %path.display(),
                replaced = previous.len(),
                "previous plugin generation removed"
            );
        }

        let record = LoadedPlugin {
            path: path.to_path_buf(),
            kind,
            factory,
            capabilities: keys.iter().map(|(_, name)| name.clone()).collect(),
            modified,
            loaded_at: Utc::now(),
            last_error,
            keys,
        };
        plugins.insert(path.to_path_buf(), record);
        &plugins[path]
    }

    fn build(
        &self,
        kind: CapabilityKind,
        path: &Path,
    ) -> (Option<String>, Result<CapabilityMap, PluginError>) {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                return (
                    None,
                    Err(PluginError::Read {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }),
                )
            }
        };
        let descriptor = match PluginDescriptor::parse(path, &raw) {
            Ok(descriptor) => descriptor,
            Err(e) => return (None, Err(e)),
        };

        let Some(factory) = self.catalog.get(&descriptor.factory) else {
            let err = PluginError::UnknownFactory {
                path: path.display().to_string(),
                factory: descriptor.factory.clone(),
            };
            return (Some(descriptor.factory), Err(err));
        };

        let ctx = FactoryContext {
            registry: &self.registry,
            downstream: &self.downstream,
            kind,
            options: &descriptor.options,
            source: path,
        };
        (Some(descriptor.factory.clone()), factory.build(&ctx))
    }

    fn resolve_id(
        &self,
        plugins: &BTreeMap<PathBuf, LoadedPlugin>,
        id: &str,
    ) -> Result<(CapabilityKind, PathBuf), PluginError> {
        let unknown = || PluginError::UnknownPlugin { id: id.to_string() };
        let as_path = Path::new(id);

        if let Some(record) = plugins.get(as_path) {
            return Ok((record.kind, record.path.clone()));
        }

        // Every plugin file currently on disk, tracked or not.
        let mut candidates: Vec<(CapabilityKind, PathBuf)> = Vec::new();
        for (kind, dir) in &self.dirs {
            for path in scan_dir(*kind, dir, false).unwrap_or_default() {
                candidates.push((*kind, path));
            }
        }

        if let Some(found) = candidates.iter().find(|(_, path)| path == as_path) {
            return Ok(found.clone());
        }

        let matches: Vec<_> = candidates
            .into_iter()
            .filter(|(_, path)| {
                let file_name = path.file_name().and_then(|n| n.to_str());
                let stem = path.file_stem().and_then(|n| n.to_str());
                file_name == Some(id) || stem == Some(id)
            })
            .collect();
        match matches.len() {
            1 => matches.into_iter().next().ok_or_else(unknown),
            0 => Err(unknown()),
            _ => Err(PluginError::UnknownPlugin {
                id: format!("{id} (ambiguous: matches {} files)", matches.len()),
            }),
        }
    }
}

// ─── File helpers ────────────────────────────────────────────────────────────

/// Plugin files in `dir`, sorted. `None` if the directory cannot be read.
fn scan_dir(kind: CapabilityKind, dir: &Path, warn_missing: bool) -> Option<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if warn_missing {
                tracing::warn!(
                    kind = %kind,
                    path = %dir.display(),
                    error = %e,
                    "plugin directory not found, skipping"
                );
            }
            return None;
        }
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_plugin_file(path))
        .collect();
    files.sort();
    Some(files)
}

fn is_plugin_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('_') || name.starts_with('.') {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| PLUGIN_EXTENSIONS.iter().any(|p| ext.eq_ignore_ascii_case(p)))
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn is_newer(current: Option<DateTime<Utc>>, recorded: Option<DateTime<Utc>>) -> bool {
    match (current, recorded) {
        (Some(current), Some(recorded)) => current > recorded,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
