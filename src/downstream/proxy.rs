//! Connector contract and proxy capability registration.
//!
//! Both connector kinds run the same handshake: send `list_all`, then
//! register one proxy capability per reported entry under
//! `prefix + peer_name`. Invoking a proxy forwards the matching
//! `run_tool` / `access_resource` / `run_agent` request to the peer.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::DownstreamError;
use crate::protocol::{unwrap_reply, Request};
use crate::registry::{
    Capability, CapabilityDescriptor, CapabilityKind, EntryKey, InvokeError, Registry,
};

// ─── Connector ───────────────────────────────────────────────────────────────

/// One live connection to a downstream peer.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Caller-chosen downstream name.
    fn name(&self) -> &str;

    /// Send one request and return the peer's decoded reply line.
    async fn call(&self, request: &Request) -> Result<Value, DownstreamError>;
}

/// Prefix applied to every capability imported from `name`.
pub fn prefix_for(name: &str) -> String {
    format!("{}_", name.to_uppercase())
}

/// Check that `name` yields a usable prefix.
///
/// Host names and IP addresses are valid names; only empty names and names
/// containing whitespace or control characters are rejected.
pub fn validate_name(name: &str) -> Result<(), DownstreamError> {
    let reason = if name.is_empty() {
        "name must not be empty"
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "name must not contain whitespace or control characters"
    } else {
        return Ok(());
    };
    Err(DownstreamError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// Capabilities a peer reported in its handshake reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovered {
    pub tools: Vec<CapabilityDescriptor>,
    pub resources: Vec<CapabilityDescriptor>,
    pub agents: Vec<CapabilityDescriptor>,
}

impl Discovered {
    fn of_mut(&mut self, kind: CapabilityKind) -> &mut Vec<CapabilityDescriptor> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::Agent => &mut self.agents,
        }
    }

    /// Iterate every entry with its namespace.
    pub fn entries(&self) -> impl Iterator<Item = (CapabilityKind, &CapabilityDescriptor)> {
        self.tools
            .iter()
            .map(|d| (CapabilityKind::Tool, d))
            .chain(self.resources.iter().map(|d| (CapabilityKind::Resource, d)))
            .chain(self.agents.iter().map(|d| (CapabilityKind::Agent, d)))
    }

    pub fn len(&self) -> usize {
        self.tools.len() + self.resources.len() + self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode a `list_all` reply.
///
/// Entries that cannot be decoded (e.g. missing `name`) are skipped with a
/// warning; a reply that is not an object, or that carries `error`, fails.
pub fn parse_handshake(name: &str, reply: Value) -> Result<Discovered, DownstreamError> {
    let Value::Object(mut obj) = reply else {
        return Err(DownstreamError::HandshakeFailed {
            name: name.to_string(),
            reason: "list_all reply is not a JSON object".into(),
        });
    };

    if let Some(err) = obj.remove("error") {
        return Err(DownstreamError::HandshakeFailed {
            name: name.to_string(),
            reason: format!("peer returned error: {err}"),
        });
    }

    let mut discovered = Discovered::default();
    for kind in CapabilityKind::ALL {
        let Some(entries) = obj.remove(kind.plural()) else {
            continue;
        };
        let Value::Array(entries) = entries else {
            tracing::warn!(downstream = name, key = kind.plural(), "handshake list is not an array");
            continue;
        };
        for entry in entries {
            match serde_json::from_value::<CapabilityDescriptor>(entry) {
                Ok(desc) => discovered.of_mut(kind).push(desc),
                Err(e) => tracing::warn!(
                    downstream = name,
                    kind = %kind,
                    error = %e,
                    "skipping undecodable handshake entry"
                ),
            }
        }
    }
    Ok(discovered)
}

/// Run the `list_all` exchange against a connector.
pub async fn discover(connector: &dyn Connector) -> Result<Discovered, DownstreamError> {
    let reply = connector
        .call(&Request::list_all())
        .await
        .map_err(|e| DownstreamError::HandshakeFailed {
            name: connector.name().to_string(),
            reason: e.to_string(),
        })?;
    parse_handshake(connector.name(), reply)
}

// ─── Proxies ─────────────────────────────────────────────────────────────────

/// Build a capability that forwards invocations of `peer_name` to `connector`.
pub fn proxy_capability(
    connector: Arc<dyn Connector>,
    kind: CapabilityKind,
    prefix: &str,
    descriptor: &CapabilityDescriptor,
) -> Capability {
    let peer_name = descriptor.name.clone();
    Capability::new(
        kind,
        format!("{prefix}{peer_name}"),
        descriptor.description.clone(),
        move |args| {
            let connector = Arc::clone(&connector);
            let request = Request::invoke(kind, &peer_name, args);
            async move {
                let reply = connector.call(&request).await?;
                unwrap_reply(reply).map_err(|message| InvokeError::Remote { message })
            }
        },
    )
    .with_parameters(descriptor.parameters.clone())
}

/// Discover a peer's capabilities and register prefixed proxies for them.
///
/// Returns the registry keys that were added.
pub async fn handshake(
    connector: Arc<dyn Connector>,
    prefix: &str,
    registry: &Registry,
) -> Result<Vec<EntryKey>, DownstreamError> {
    let discovered = discover(connector.as_ref()).await?;
    let proxies: Vec<Capability> = discovered
        .entries()
        .map(|(kind, desc)| proxy_capability(Arc::clone(&connector), kind, prefix, desc))
        .collect();

    let keys = registry.register_all(proxies);
    tracing::info!(
        downstream = connector.name(),
        tools = discovered.tools.len(),
        resources = discovered.resources.len(),
        agents = discovered.agents.len(),
        "registered downstream capabilities"
    );
    Ok(keys)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// In-memory peer that answers from a fixed script and records requests.
    struct ScriptedPeer {
        handshake: Value,
        seen: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl Connector for ScriptedPeer {
        fn name(&self) -> &str {
            "alpha"
        }

        async fn call(&self, request: &Request) -> Result<Value, DownstreamError> {
            self.seen.lock().push(request.clone());
            match request.verb.as_str() {
                "list_all" => Ok(self.handshake.clone()),
                "run_tool" if request.name.as_deref() == Some("broken") => {
                    Err(DownstreamError::Transport {
                        name: "alpha".into(),
                        reason: "pipe closed".into(),
                    })
                }
                "run_tool" => Ok(json!({"ok": true, "result": {"echo": request.args}})),
                _ => Ok(json!({"error": format!("unknown request type: {}", request.verb)})),
            }
        }
    }

    fn peer(handshake: Value) -> Arc<ScriptedPeer> {
        Arc::new(ScriptedPeer {
            handshake,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_prefix_for_uppercases() {
        assert_eq!(prefix_for("alpha"), "ALPHA_");
        assert_eq!(prefix_for("my-svc"), "MY-SVC_");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("analytics").is_ok());
        assert!(validate_name("svc_2").is_ok());
        assert!(validate_name("db.internal").is_ok());
        assert!(validate_name("10.0.0.5").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("tab\tname").is_err());
        assert_eq!(prefix_for("db.internal"), "DB.INTERNAL_");
    }

    #[test]
    fn test_parse_handshake_defaults_and_skips() {
        let discovered = parse_handshake(
            "alpha",
            json!({
                "tools": [{"name": "summarize"}, {"description": "no name"}],
                "resources": [{"name": "docs", "description": "d"}],
            }),
        )
        .unwrap();
        assert_eq!(discovered.tools.len(), 1);
        assert_eq!(discovered.tools[0].description, "");
        assert_eq!(discovered.resources[0].name, "docs");
        assert!(discovered.agents.is_empty());
    }

    #[test]
    fn test_parse_handshake_rejects_error_reply() {
        let err = parse_handshake("alpha", json!({"error": "busy"})).unwrap_err();
        assert!(matches!(err, DownstreamError::HandshakeFailed { .. }));
        assert!(parse_handshake("alpha", json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_handshake_registers_prefixed_names_only() {
        let registry = Registry::new();
        let p = peer(json!({
            "tools": [{"name": "summarize", "parameters": [{"name": "text", "type": "str", "required": true}]}],
            "resources": [{"name": "docs"}],
            "agents": [{"name": "writer"}],
        }));

        let keys = handshake(p.clone(), "ALPHA_", &registry).await.unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(registry.list(CapabilityKind::Tool), vec!["ALPHA_summarize"]);
        assert!(!registry.contains(CapabilityKind::Tool, "summarize"));
        assert_eq!(registry.list(CapabilityKind::Resource), vec!["ALPHA_docs"]);
        assert_eq!(registry.list(CapabilityKind::Agent), vec!["ALPHA_writer"]);

        let tool = registry.get(CapabilityKind::Tool, "ALPHA_summarize").unwrap();
        assert_eq!(tool.parameters()[0].name, "text");
    }

    #[tokio::test]
    async fn test_proxy_forwards_with_peer_name() {
        let registry = Registry::new();
        let p = peer(json!({"tools": [{"name": "summarize"}]}));
        handshake(p.clone(), "ALPHA_", &registry).await.unwrap();

        let tool = registry.get(CapabilityKind::Tool, "ALPHA_summarize").unwrap();
        let result = tool.invoke(json!({"text": "long"})).await.unwrap();
        assert_eq!(result, json!({"echo": {"text": "long"}}));

        let seen = p.seen.lock();
        let last = seen.last().unwrap();
        assert_eq!(last.verb, "run_tool");
        assert_eq!(last.name.as_deref(), Some("summarize"));
    }

    #[tokio::test]
    async fn test_proxy_maps_failures() {
        let registry = Registry::new();
        let p = peer(json!({"tools": [{"name": "broken"}], "agents": [{"name": "writer"}]}));
        handshake(p, "ALPHA_", &registry).await.unwrap();

        let broken = registry.get(CapabilityKind::Tool, "ALPHA_broken").unwrap();
        let err = broken.invoke(json!({})).await.unwrap_err();
        assert!(matches!(err, InvokeError::Downstream { .. }));

        // The scripted peer does not understand run_agent and says so.
        let writer = registry.get(CapabilityKind::Agent, "ALPHA_writer").unwrap();
        let err = writer.invoke(json!({})).await.unwrap_err();
        match err {
            InvokeError::Remote { message } => assert!(message.contains("run_agent")),
            other => panic!("expected Remote, got {other:?}"),
        }
    }
}
