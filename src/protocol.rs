//! Wire types for the line-delimited JSON protocol.
//!
//! The same protocol is spoken in both directions: upstream clients send it
//! to the router, and the router sends it to downstream peers. One JSON
//! object per line, each way.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::CapabilityKind;

// ─── Requests ────────────────────────────────────────────────────────────────

/// A request line: `{"type": <verb>, "name"?: string, "args"?: object}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type", default)]
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Request {
    /// The discovery handshake request.
    pub fn list_all() -> Self {
        Self {
            verb: "list_all".to_string(),
            ..Self::default()
        }
    }

    /// An invocation of `name` in the namespace `kind`.
    pub fn invoke(kind: CapabilityKind, name: &str, args: Value) -> Self {
        Self {
            verb: kind.invoke_verb().to_string(),
            name: Some(name.to_string()),
            args: Some(args),
        }
    }
}

/// Parsed request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    ListAll,
    List(CapabilityKind),
    Invoke(CapabilityKind),
}

impl Verb {
    pub fn parse(verb: &str) -> Option<Self> {
        let parsed = match verb {
            "list_all" => Verb::ListAll,
            "list_tools" => Verb::List(CapabilityKind::Tool),
            "list_resources" => Verb::List(CapabilityKind::Resource),
            "list_agents" => Verb::List(CapabilityKind::Agent),
            "run_tool" => Verb::Invoke(CapabilityKind::Tool),
            "access_resource" => Verb::Invoke(CapabilityKind::Resource),
            "run_agent" => Verb::Invoke(CapabilityKind::Agent),
            _ => return None,
        };
        Some(parsed)
    }
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// Response to an invocation verb.
///
/// `Error` is listed first so a peer reply carrying both `ok` and `error`
/// decodes as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InvokeResponse {
    Error { error: String },
    Ok { ok: bool, result: Value },
}

impl InvokeResponse {
    pub fn ok(result: Value) -> Self {
        InvokeResponse::Ok { ok: true, result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        InvokeResponse::Error {
            error: message.into(),
        }
    }
}

/// Interpret a peer's reply to an invocation.
///
/// `{"error": ...}` becomes `Err`, `{"ok": .., "result": ..}` yields the
/// result, and anything else is passed through unchanged.
pub fn unwrap_reply(reply: Value) -> Result<Value, String> {
    match reply {
        Value::Object(mut obj) => {
            if let Some(err) = obj.remove("error") {
                return Err(match err {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            if obj.contains_key("ok") || obj.contains_key("result") {
                return Ok(obj.remove("result").unwrap_or(Value::Null));
            }
            Ok(Value::Object(obj))
        }
        other => Ok(other),
    }
}

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Serialize a message as one protocol line (with trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
