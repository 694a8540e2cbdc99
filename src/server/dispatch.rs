//! Request dispatch: one protocol line in, one JSON response out.
//!
//! Every failure, including a panicking handler, becomes an `{"error": ...}`
//! value. Nothing here closes the connection.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::{json, Value};

use crate::protocol::{InvokeResponse, Request, Verb};
use crate::registry::{CapabilityKind, Registry};

/// Decode and answer one request line.
pub async fn handle_line(registry: &Registry, line: &str) -> Value {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle_request(registry, request).await,
        Err(e) => json!({ "error": format!("invalid request: {e}") }),
    }
}

/// Answer one decoded request.
pub async fn handle_request(registry: &Registry, request: Request) -> Value {
    let Some(verb) = Verb::parse(&request.verb) else {
        return json!({ "error": format!("unknown request type: {}", request.verb) });
    };

    match verb {
        Verb::ListAll => serde_json::to_value(registry.snapshot())
            .unwrap_or_else(|e| json!({ "error": format!("failed to encode registry: {e}") })),
        Verb::List(kind) => {
            let mut listing = serde_json::Map::new();
            listing.insert(kind.plural().to_string(), json!(registry.list(kind)));
            Value::Object(listing)
        }
        Verb::Invoke(kind) => {
            let response = invoke(registry, kind, request).await;
            serde_json::to_value(response)
                .unwrap_or_else(|e| json!({ "error": format!("failed to encode response: {e}") }))
        }
    }
}

async fn invoke(registry: &Registry, kind: CapabilityKind, request: Request) -> InvokeResponse {
    let name = request.name.unwrap_or_default();
    // The registry lock is released before the handler runs.
    let Some(capability) = registry.get(kind, &name) else {
        return InvokeResponse::error(format!("{} not found: {name}", kind.label()));
    };

    let args = request.args.unwrap_or(Value::Null);
    let outcome = AssertUnwindSafe(capability.invoke(args)).catch_unwind().await;
    match outcome {
        Ok(Ok(result)) => InvokeResponse::ok(result),
        Ok(Err(e)) => {
            tracing::warn!(kind = %kind, name = %name, error = %e, "{} failed", failure_label(kind));
            InvokeResponse::error(format!("{}: {e}", failure_label(kind)))
        }
        Err(_) => {
            tracing::error!(kind = %kind, name = %name, "capability handler panicked");
            InvokeResponse::error(format!("{}: handler panicked", failure_label(kind)))
        }
    }
}

fn failure_label(kind: CapabilityKind) -> &'static str {
    match kind {
        CapabilityKind::Tool => "tool run error",
        CapabilityKind::Resource => "resource access error",
        CapabilityKind::Agent => "agent run error",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
