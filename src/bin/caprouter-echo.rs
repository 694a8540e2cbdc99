//! Minimal downstream peer for caprouter.
//!
//! Speaks the line protocol on stdin/stdout by default, or over TCP with
//! `--listen <addr>`. Logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use caprouter::config::LogConfig;
use caprouter::logging::init_tracing;
use caprouter::protocol::encode_line;
use caprouter::registry::{Capability, InvokeError, ParameterSpec, Registry};
use caprouter::server::{handle_line, RouterServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Reference caprouter downstream", long_about = None)]
struct Args {
    /// Serve TCP on this address instead of stdio
    #[arg(short, long)]
    listen: Option<String>,
}

fn echo_registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.register(Capability::tool("ping", "Liveness check", |_| async {
        Ok(json!("pong"))
    }));
    registry.register(Capability::tool("echo", "Return the arguments unchanged", |args| async move {
        Ok(args)
    }));
    registry.register(
        Capability::tool("fail", "Always fails with the given reason", |args: Value| async move {
            let reason = args
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_string();
            Err::<Value, _>(InvokeError::failed(reason))
        })
        .with_parameters(vec![ParameterSpec::optional("reason", "str")]),
    );
    registry.register(Capability::resource("motd", "Message of the day", |_| async {
        Ok(json!("hello from caprouter-echo"))
    }));
    registry.register(
        Capability::agent("parrot", "Repeats the prompt", |args: Value| async move {
            let prompt = args.get("prompt").and_then(Value::as_str).unwrap_or_default();
            Ok(json!({ "reply": prompt }))
        })
        .with_parameters(vec![ParameterSpec::required("prompt", "str")]),
    );
    registry
}

async fn serve_stdio(registry: Arc<Registry>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(&registry, line).await;
        stdout.write_all(encode_line(&response)?.as_bytes()).await?;
        stdout.flush().await?;
    }
    tracing::info!("stdin closed, exiting");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&LogConfig {
        filter: "caprouter_echo=info,caprouter=info,warn".into(),
        ..LogConfig::default()
    })?;

    let registry = echo_registry();
    match args.listen {
        Some(addr) => {
            let server = RouterServer::bind(&addr, registry).await?;
            server.serve().await?;
        }
        None => serve_stdio(registry).await?,
    }
    Ok(())
}
