//! Capability records: the unit the registry stores and the server invokes.
//!
//! Tools, resources and agents share one record type distinguished by
//! [`CapabilityKind`]. A record is immutable once built and is shared as
//! `Arc<Capability>`, so a lookup can hand it out and release the registry
//! lock before the (possibly slow) invocation starts.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::InvokeError;

// ─── Kind ────────────────────────────────────────────────────────────────────

/// Which namespace a capability lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Agent,
}

impl CapabilityKind {
    /// All namespaces, in listing order.
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Tool,
        CapabilityKind::Resource,
        CapabilityKind::Agent,
    ];

    /// Singular label used in error messages (`tool not found: x`).
    pub fn label(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Agent => "agent",
        }
    }

    /// Plural key used in listings and handshakes (`{"tools": [...]}`).
    pub fn plural(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools",
            CapabilityKind::Resource => "resources",
            CapabilityKind::Agent => "agents",
        }
    }

    /// Request verb that invokes a capability of this kind on a peer.
    pub fn invoke_verb(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "run_tool",
            CapabilityKind::Resource => "access_resource",
            CapabilityKind::Agent => "run_agent",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ─── Schema ──────────────────────────────────────────────────────────────────

/// One entry of a capability's ordered parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_type_tag")]
    pub type_tag: String,
    #[serde(default)]
    pub required: bool,
}

fn default_type_tag() -> String {
    "any".to_string()
}

impl ParameterSpec {
    pub fn required(name: &str, type_tag: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, type_tag: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            required: false,
        }
    }
}

/// External shape of a capability: what `list_all` and handshakes carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

// ─── Capability ──────────────────────────────────────────────────────────────

/// Bound invocation closure.
pub type Handler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, InvokeError>> + Send + Sync>;

/// Name → record map returned by plugin factories.
pub type CapabilityMap = BTreeMap<String, Capability>;

/// A named, described, invocable unit held in the registry.
#[derive(Clone)]
pub struct Capability {
    kind: CapabilityKind,
    name: String,
    description: String,
    parameters: Vec<ParameterSpec>,
    handler: Handler,
}

impl Capability {
    /// Build a capability from an async handler.
    pub fn new<F, Fut>(
        kind: CapabilityKind,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        Self {
            kind,
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }

    pub fn tool<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        Self::new(CapabilityKind::Tool, name, description, handler)
    }

    pub fn resource<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        Self::new(CapabilityKind::Resource, name, description, handler)
    }

    pub fn agent<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        Self::new(CapabilityKind::Agent, name, description, handler)
    }

    /// Attach the ordered parameter schema.
    pub fn with_parameters(mut self, parameters: Vec<ParameterSpec>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Rename the record, keeping its handler.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    /// Description + schema, without the handler.
    pub fn describe(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// Validate `args` against the required parameters, then run the handler.
    ///
    /// A missing or `null` argument object is treated as `{}`.
    pub async fn invoke(&self, args: Value) -> Result<Value, InvokeError> {
        let args = match args {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        self.check_required(&args)?;
        (self.handler)(args).await
    }

    fn check_required(&self, args: &Value) -> Result<(), InvokeError> {
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        if required.is_empty() {
            return Ok(());
        }

        let obj = args.as_object().ok_or_else(|| InvokeError::InvalidArguments {
            capability: self.name.clone(),
            reason: "arguments must be a JSON object".into(),
        })?;

        for field in required {
            if !obj.contains_key(field) {
                return Err(InvokeError::InvalidArguments {
                    capability: self.name.clone(),
                    reason: format!("missing required field: '{field}'"),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Collect capabilities into a map keyed by their names.
pub fn into_map(capabilities: impl IntoIterator<Item = Capability>) -> CapabilityMap {
    capabilities
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> Capability {
        Capability::tool("echo", "Echo the arguments back", |args| async move { Ok(args) })
            .with_parameters(vec![
                ParameterSpec::required("text", "str"),
                ParameterSpec::optional("repeat", "int"),
            ])
    }

    #[tokio::test]
    async fn test_invoke_passes_args_through() {
        let result = echo_tool().invoke(json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_invoke_rejects_missing_required_field() {
        let err = echo_tool().invoke(json!({"repeat": 2})).await.unwrap_err();
        match err {
            InvokeError::InvalidArguments { capability, reason } => {
                assert_eq!(capability, "echo");
                assert!(reason.contains("text"));
            }
            other => panic!("expected InvalidArguments, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_null_args_become_empty_object() {
        let cap = Capability::agent("noop", "", |args| async move { Ok(args) });
        assert_eq!(cap.invoke(Value::Null).await.unwrap(), json!({}));
    }

    #[test]
    fn test_describe_omits_handler() {
        let desc = echo_tool().describe();
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["name"], "echo");
        assert_eq!(json["parameters"][0]["type"], "str");
        assert_eq!(json["parameters"][0]["required"], true);
    }

    #[test]
    fn test_descriptor_defaults() {
        let desc: CapabilityDescriptor = serde_json::from_str(r#"{"name": "ping"}"#).unwrap();
        assert_eq!(desc.description, "");
        assert!(desc.parameters.is_empty());
    }

    #[test]
    fn test_kind_verbs() {
        assert_eq!(CapabilityKind::Tool.invoke_verb(), "run_tool");
        assert_eq!(CapabilityKind::Resource.invoke_verb(), "access_resource");
        assert_eq!(CapabilityKind::Agent.invoke_verb(), "run_agent");
        assert_eq!(CapabilityKind::Resource.plural(), "resources");
    }
}
