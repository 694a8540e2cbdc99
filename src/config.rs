//! Router configuration loading.
//!
//! Reads `caprouter.yaml` and resolves environment variables. Every field has
//! a default, so running without a config file is supported.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::downstream::LocalCommand;

/// Env var naming an explicit config file.
pub const CONFIG_ENV: &str = "CAPROUTER_CONFIG";
/// File name searched for in the working and user config directories.
pub const CONFIG_FILE_NAME: &str = "caprouter.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level router configuration (mirrors `caprouter.yaml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub plugins: PluginsConfig,
    pub downstream: DownstreamConfig,
    /// Local downstreams launched at startup, keyed by downstream name.
    pub local: BTreeMap<String, LocalCommand>,
    /// Running services attached at startup, keyed by downstream name.
    pub services: BTreeMap<String, ServiceConfig>,
    pub log: LogConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3456,
            plugins: PluginsConfig::default(),
            downstream: DownstreamConfig::default(),
            local: BTreeMap::new(),
            services: BTreeMap::new(),
            log: LogConfig::default(),
        }
    }
}

impl RouterConfig {
    /// `host:port` the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Plugin source directories and hot-reload settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub tools_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub reload_interval_ms: u64,
    pub hot_reload: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            tools_dir: PathBuf::from("tools"),
            resources_dir: PathBuf::from("resources"),
            agents_dir: PathBuf::from("agents"),
            reload_interval_ms: 2000,
            hot_reload: true,
        }
    }
}

impl PluginsConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms.max(1))
    }
}

/// Downstream connection tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Container CLI used for remote launches.
    pub container_runtime: String,
    /// Protocol port inside launched containers.
    pub container_port: u16,
    /// Fixed wait between container launch and the TCP attach.
    pub container_settle_ms: u64,
    pub launch_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_secs: u64,
    /// Grace period between closing a child's stdin and killing it.
    pub stop_grace_ms: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            container_runtime: "docker".into(),
            container_port: 3456,
            container_settle_ms: 1000,
            launch_timeout_secs: 60,
            connect_timeout_ms: 5000,
            handshake_timeout_secs: 30,
            stop_grace_ms: 2000,
        }
    }
}

impl DownstreamConfig {
    pub fn container_settle(&self) -> Duration {
        Duration::from_millis(self.container_settle_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// A running service reachable over TCP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    #[serde(default = "default_service_port")]
    pub port: u16,
}

fn default_service_port() -> u16 {
    3456
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
    pub format: LogFormat,
    /// Log file path. When unset, logs go to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "caprouter=info,warn".into(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `CAPROUTER_CONFIG`, `./caprouter.yaml`, then
/// `<user config dir>/caprouter/caprouter.yaml`. Returns `None` when no
/// file exists, meaning defaults apply.
pub fn find_config_path(cwd: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }

    let local = cwd.join(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|dir| dir.join("caprouter").join(CONFIG_FILE_NAME))
        .filter(|candidate| candidate.exists())
}

/// Load and parse a config file.
///
/// Performs `${VAR}` / `${VAR:-default}` interpolation before parsing and
/// resolves relative plugin directories against the file's directory.
pub fn load_config(path: &Path) -> Result<RouterConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    // An empty file is a valid "all defaults" config.
    let mut config: RouterConfig = if interpolated.trim().is_empty() {
        RouterConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
    };

    if let Some(base) = path.parent() {
        config.plugins.resolve_relative_to(base);
    }
    Ok(config)
}

/// Resolve the effective configuration for this process.
///
/// An explicit path (from the command line) wins over the search order and
/// must exist.
pub fn resolve_config(
    explicit: Option<&Path>,
) -> Result<(RouterConfig, Option<PathBuf>), ConfigError> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            find_config_path(&cwd)
        }
    };
    let mut config = match &path {
        Some(path) => load_config(path)?,
        None => RouterConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok((config, path))
}

/// Apply `CAPROUTER_HOST` / `CAPROUTER_PORT`.
pub fn apply_env_overrides(config: &mut RouterConfig) -> Result<(), ConfigError> {
    if let Ok(host) = std::env::var("CAPROUTER_HOST") {
        if !host.is_empty() {
            config.host = host;
        }
    }
    if let Ok(port) = std::env::var("CAPROUTER_PORT") {
        config.port = port.parse().map_err(|_| ConfigError::Invalid {
            reason: format!("CAPROUTER_PORT is not a valid port: '{port}'"),
        })?;
    }
    Ok(())
}

impl PluginsConfig {
    fn resolve_relative_to(&mut self, base: &Path) {
        for dir in [
            &mut self.tools_dir,
            &mut self.resources_dir,
            &mut self.agents_dir,
        ] {
            let expanded = PathBuf::from(expand_tilde(&dir.to_string_lossy()));
            *dir = if expanded.is_relative() {
                base.join(expanded)
            } else {
                expanded
            };
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` references.
///
/// An unterminated `${` is kept as written.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some((before, after)) = rest.split_once("${") {
        out.push_str(before);
        match after.split_once('}') {
            Some((expr, tail)) => {
                out.push_str(&resolve_var_expr(expr));
                rest = tail;
            }
            None => {
                out.push_str("${");
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Value for `VAR` or `VAR:-default`. An empty variable counts as unset
/// when a default is given.
fn resolve_var_expr(expr: &str) -> String {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (expr, None),
    };
    match (std::env::var(name), default) {
        (Ok(value), Some(_)) if !value.is_empty() => value,
        (Ok(value), None) => value,
        (_, Some(default)) => expand_tilde(default),
        (Err(_), None) => String::new(),
    }
}

/// Expand `~` or a leading `~/` to the home directory. `~user` is left alone.
fn expand_tilde(path: &str) -> String {
    let home = || dirs::home_dir().map(|h| h.display().to_string());
    match path {
        "~" => home().unwrap_or_else(|| path.to_string()),
        _ => match (path.strip_prefix("~/"), home()) {
            (Some(rest), Some(home)) => format!("{home}/{rest}"),
            _ => path.to_string(),
        },
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
