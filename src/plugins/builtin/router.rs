//! `router` factory: `ROUTER_*` management tools.
//!
//! These let a client drive the downstream manager and the plugin loader
//! through the ordinary `run_tool` verb. Handlers hold weak references so
//! the registry does not keep the components that own it alive.

use std::sync::{Arc, Weak};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::downstream::{DownstreamManager, LocalCommand};
use crate::plugins::catalog::{CapabilityFactory, FactoryContext};
use crate::plugins::errors::PluginError;
use crate::plugins::loader::DynamicLoader;
use crate::registry::{
    into_map, Capability, CapabilityKind, CapabilityMap, InvokeError, ParameterSpec, Registry,
};

/// Protocol port assumed for `ROUTER_connect_service` when none is given.
const DEFAULT_SERVICE_PORT: u16 = 3456;

pub struct RouterFactory;

impl CapabilityFactory for RouterFactory {
    fn name(&self) -> &'static str {
        "router"
    }

    fn build(&self, ctx: &FactoryContext<'_>) -> Result<CapabilityMap, PluginError> {
        if ctx.kind != CapabilityKind::Tool {
            return Err(ctx.error(format!(
                "the router factory only provides tools, not {}",
                ctx.kind.plural()
            )));
        }
        Ok(router_tools(ctx.registry, ctx.downstream))
    }
}

// ─── Argument helpers ────────────────────────────────────────────────────────

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T, InvokeError> {
    serde_json::from_value(args).map_err(|e| InvokeError::InvalidArguments {
        capability: tool.to_string(),
        reason: e.to_string(),
    })
}

fn upgrade<T>(weak: &Weak<T>) -> Result<Arc<T>, InvokeError> {
    weak.upgrade()
        .ok_or_else(|| InvokeError::failed("router is shutting down"))
}

/// `cmd` may be an argv list or a single whitespace-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

impl CommandLine {
    fn into_command(self) -> Option<LocalCommand> {
        match self {
            CommandLine::Argv(argv) => LocalCommand::from_argv(&argv),
            CommandLine::Line(line) => {
                LocalCommand::from_argv(&line.split_whitespace().collect::<Vec<_>>())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectLocalArgs {
    name: String,
    cmd: CommandLine,
}

#[derive(Debug, Deserialize)]
struct ConnectRemoteArgs {
    name: String,
    image: String,
    #[serde(default)]
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ConnectServiceArgs {
    service_name: String,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DownstreamType {
    Local,
    Remote,
}

#[derive(Debug, Deserialize)]
struct DisconnectArgs {
    name: String,
    #[serde(rename = "type", default = "default_type")]
    kind: DownstreamType,
}

fn default_type() -> DownstreamType {
    DownstreamType::Local
}

#[derive(Debug, Deserialize)]
struct ReloadArgs {
    path: String,
}

// ─── Downstream tools ────────────────────────────────────────────────────────

/// Build the downstream-management and registry-inspection tools.
pub fn router_tools(registry: &Arc<Registry>, downstream: &Arc<DownstreamManager>) -> CapabilityMap {
    let registry = Arc::downgrade(registry);
    let downstream = Arc::downgrade(downstream);
    let mut tools = Vec::new();

    let mgr = downstream.clone();
    tools.push(
        Capability::tool(
            "ROUTER_connect_local_server",
            "Start a local server subprocess and connect via stdio. args: name, cmd",
            move |args| {
                let mgr = mgr.clone();
                async move {
                    const TOOL: &str = "ROUTER_connect_local_server";
                    let args: ConnectLocalArgs = parse_args(TOOL, args)?;
                    let command = args.cmd.into_command().ok_or_else(|| {
                        InvokeError::InvalidArguments {
                            capability: TOOL.to_string(),
                            reason: "cmd must not be empty".into(),
                        }
                    })?;
                    let attachment = upgrade(&mgr)?.connect_local(&args.name, &command).await?;
                    Ok(json!({
                        "ok": true,
                        "connected": attachment.name,
                        "already_connected": attachment.already_connected,
                        "capabilities": attachment.capabilities,
                    }))
                }
            },
        )
        .with_parameters(vec![
            ParameterSpec::required("name", "str"),
            ParameterSpec::required("cmd", "list"),
        ]),
    );

    let mgr = downstream.clone();
    tools.push(
        Capability::tool(
            "ROUTER_connect_remote_server",
            "Launch a container for a remote server and connect to it. args: name, image, extra_args",
            move |args| {
                let mgr = mgr.clone();
                async move {
                    let args: ConnectRemoteArgs = parse_args("ROUTER_connect_remote_server", args)?;
                    let extra = args.extra_args.unwrap_or_default();
                    let attachment = upgrade(&mgr)?
                        .connect_remote_docker(&args.name, &args.image, &extra)
                        .await?;
                    Ok(json!({
                        "ok": true,
                        "container_id": attachment.container_id,
                        "connected": attachment.name,
                        "already_connected": attachment.already_connected,
                        "capabilities": attachment.capabilities,
                    }))
                }
            },
        )
        .with_parameters(vec![
            ParameterSpec::required("name", "str"),
            ParameterSpec::required("image", "str"),
            ParameterSpec::optional("extra_args", "list"),
        ]),
    );

    let mgr = downstream.clone();
    tools.push(
        Capability::tool(
            "ROUTER_connect_service",
            "Connect the router to a running service by its host name.",
            move |args| {
                let mgr = mgr.clone();
                async move {
                    let args: ConnectServiceArgs = parse_args("ROUTER_connect_service", args)?;
                    let name = args.service_name;
                    let port = args.port.unwrap_or(DEFAULT_SERVICE_PORT);
                    tracing::info!(service = %name, port, "connecting to service");
                    match upgrade(&mgr)?.connect_service(&name, &name, port).await {
                        Ok(_) => Ok(json!({
                            "status": "success",
                            "message": format!("Successfully connected to service '{name}'."),
                        })),
                        Err(e) => {
                            tracing::error!(service = %name, error = %e, "service connect failed");
                            Ok(json!({
                                "status": "error",
                                "message": format!("Failed to connect to service '{name}'."),
                                "error": e.to_string(),
                            }))
                        }
                    }
                }
            },
        )
        .with_parameters(vec![
            ParameterSpec::required("service_name", "str"),
            ParameterSpec::optional("port", "int"),
        ]),
    );

    let mgr = downstream.clone();
    tools.push(
        Capability::tool(
            "ROUTER_disconnect_server",
            "Disconnect a named downstream server. args: name, type (local|remote)",
            move |args| {
                let mgr = mgr.clone();
                async move {
                    let args: DisconnectArgs = parse_args("ROUTER_disconnect_server", args)?;
                    let mgr = upgrade(&mgr)?;
                    let ok = match args.kind {
                        DownstreamType::Local => mgr.disconnect_local(&args.name).await,
                        DownstreamType::Remote => mgr.disconnect_remote(&args.name).await,
                    };
                    Ok(json!({ "ok": ok }))
                }
            },
        )
        .with_parameters(vec![
            ParameterSpec::required("name", "str"),
            ParameterSpec::optional("type", "str"),
        ]),
    );

    let reg = registry.clone();
    tools.push(Capability::tool(
        "ROUTER_list_registry",
        "Return a snapshot of the registry",
        move |_| {
            let reg = reg.clone();
            async move { Ok(serde_json::to_value(upgrade(&reg)?.snapshot())?) }
        },
    ));

    let mgr = downstream;
    tools.push(Capability::tool(
        "ROUTER_list_downstreams",
        "List connected local and remote downstreams",
        move |_| {
            let mgr = mgr.clone();
            async move { Ok(serde_json::to_value(upgrade(&mgr)?.list_downstreams())?) }
        },
    ));

    into_map(tools)
}

// ─── Loader tools ────────────────────────────────────────────────────────────

/// Build the plugin inspection and reload tools.
pub fn loader_tools(loader: &Arc<DynamicLoader>) -> CapabilityMap {
    let loader = Arc::downgrade(loader);
    let mut tools = Vec::new();

    let l = loader.clone();
    tools.push(Capability::tool(
        "ROUTER_list_plugins",
        "List loaded plugin files and the capabilities each contributed",
        move |_| {
            let l = l.clone();
            async move {
                let plugins = upgrade(&l)?.loaded_plugins();
                Ok(json!({ "plugins": serde_json::to_value(plugins)? }))
            }
        },
    ));

    tools.push(
        Capability::tool(
            "ROUTER_reload_plugin",
            "Reload one plugin file now. args: path (file path or name)",
            move |args| {
                let l = loader.clone();
                async move {
                    let args: ReloadArgs = parse_args("ROUTER_reload_plugin", args)?;
                    let record = upgrade(&l)?
                        .reload_plugin(&args.path)
                        .map_err(|e| InvokeError::failed(e.to_string()))?;
                    Ok(serde_json::to_value(record)?)
                }
            },
        )
        .with_parameters(vec![ParameterSpec::required("path", "str")]),
    );

    into_map(tools)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
