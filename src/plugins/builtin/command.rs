//! `command` factory: capabilities backed by an external program.
//!
//! Each invocation starts the program, writes the JSON arguments to its
//! stdin, and waits (bounded) for it to exit. Stdout is returned as JSON when
//! it parses, otherwise as a trimmed string. A non-zero exit is an error
//! carrying stderr.
//!
//! ```yaml
//! factory: command
//! options:
//!   capabilities:
//!     - name: word_count
//!       command: wc
//!       args: ["-w"]
//!       timeout_secs: 10
//! ```

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::plugins::catalog::{CapabilityFactory, FactoryContext};
use crate::plugins::errors::PluginError;
use crate::registry::{Capability, CapabilityMap, InvokeError, ParameterSpec};

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct CommandOptions {
    #[serde(default)]
    capabilities: Vec<CommandSpec>,
}

#[derive(Debug, Deserialize)]
struct CommandSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Vec<ParameterSpec>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

pub struct CommandFactory;

impl CapabilityFactory for CommandFactory {
    fn name(&self) -> &'static str {
        "command"
    }

    fn build(&self, ctx: &FactoryContext<'_>) -> Result<CapabilityMap, PluginError> {
        let options: CommandOptions = ctx.options()?;
        let mut map = CapabilityMap::new();
        for spec in options.capabilities {
            if spec.name.trim().is_empty() {
                return Err(ctx.error("capability name must not be empty"));
            }
            if spec.command.trim().is_empty() {
                return Err(ctx.error(format!("capability '{}' has an empty command", spec.name)));
            }
            if map.contains_key(&spec.name) {
                return Err(ctx.error(format!("duplicate capability name '{}'", spec.name)));
            }

            let name = spec.name.clone();
            let description = spec.description.clone();
            let parameters = spec.parameters.clone();
            let spec = Arc::new(spec);
            let capability = Capability::new(ctx.kind, name.clone(), description, move |args| {
                run_command(Arc::clone(&spec), args)
            })
            .with_parameters(parameters);
            map.insert(name, capability);
        }
        Ok(map)
    }
}

async fn run_command(spec: Arc<CommandSpec>, args: Value) -> Result<Value, InvokeError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| InvokeError::failed(format!("failed to start '{}': {e}", spec.command)))?;

    let input = serde_json::to_vec(&args)?;
    let capability = spec.name.clone();
    let exchange = async move {
        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may exit before reading it.
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(%capability, error = %e, "command did not read its input");
            }
        }
        child.wait_with_output().await
    };

    // Dropping `exchange` on timeout drops the child, which kills it.
    let timeout = Duration::from_secs(spec.timeout_secs);
    let output = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| {
            InvokeError::failed(format!(
                "'{}' timed out after {}s",
                spec.command, spec.timeout_secs
            ))
        })?
        .map_err(|e| InvokeError::failed(format!("failed to wait for '{}': {e}", spec.command)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InvokeError::failed(format!(
            "'{}' exited with {}: {}",
            spec.command,
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DownstreamConfig;
    use crate::downstream::DownstreamManager;
    use crate::registry::{CapabilityKind, Registry};
    use serde_json::json;
    use std::path::Path;

    fn build(options: Value) -> Result<CapabilityMap, PluginError> {
        let registry = Arc::new(Registry::new());
        let downstream = Arc::new(DownstreamManager::new(
            registry.clone(),
            DownstreamConfig::default(),
        ));
        CommandFactory.build(&FactoryContext {
            registry: &registry,
            downstream: &downstream,
            kind: CapabilityKind::Tool,
            options: &options,
            source: Path::new("tools/cmd.yaml"),
        })
    }

    fn single(script: &str, timeout_secs: u64) -> Capability {
        let mut map = build(json!({"capabilities": [{
            "name": "run",
            "command": "sh",
            "args": ["-c", script],
            "timeout_secs": timeout_secs,
        }]}))
        .unwrap();
        map.remove("run").unwrap()
    }

    #[tokio::test]
    async fn test_stdout_json_and_args_on_stdin() {
        let cap = single("cat", 5);
        let result = cap.invoke(json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_stdout_plain_text() {
        let cap = single("echo '  hello world '", 5);
        assert_eq!(cap.invoke(json!({})).await.unwrap(), json!("hello world"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let cap = single("echo 'disk full' >&2; exit 2", 5);
        let err = cap.invoke(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");
    }

    #[tokio::test]
    async fn test_timeout() {
        let cap = single("sleep 10", 1);
        let err = cap.invoke(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout_covers_unread_input() {
        let mut map = build(json!({"capabilities": [{
            "name": "idle",
            "command": "sleep",
            "args": ["20"],
            "timeout_secs": 1,
        }]}))
        .unwrap();
        let cap = map.remove("idle").unwrap();
        let blob = "x".repeat(512 * 1024);

        let started = std::time::Instant::now();
        let err = cap.invoke(json!({"blob": blob})).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let mut map = build(json!({"capabilities": [{"name": "x", "command": "/no/such/program"}]}))
            .unwrap();
        let err = map.remove("x").unwrap().invoke(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[test]
    fn test_invalid_options() {
        let err = build(json!({"capabilities": [{"name": "x"}]})).unwrap_err();
        assert!(matches!(err, PluginError::Factory { .. }));
        let err = build(json!({"capabilities": [{"name": "x", "command": " "}]})).unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }
}
