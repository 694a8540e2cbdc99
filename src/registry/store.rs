//! Registry store: three capability namespaces behind one lock.
//!
//! Every operation takes the lock once and releases it before returning.
//! Lookups hand back `Arc<Capability>` clones, so invocation always happens
//! outside the lock and a slow call never blocks mutation or other lookups.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::capability::{Capability, CapabilityDescriptor, CapabilityKind};

/// `(namespace, name)` pair identifying one registry entry.
pub type EntryKey = (CapabilityKind, String);

// ─── Namespaces ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Namespaces {
    tools: HashMap<String, Arc<Capability>>,
    resources: HashMap<String, Arc<Capability>>,
    agents: HashMap<String, Arc<Capability>>,
}

impl Namespaces {
    fn of(&self, kind: CapabilityKind) -> &HashMap<String, Arc<Capability>> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Agent => &self.agents,
        }
    }

    fn of_mut(&mut self, kind: CapabilityKind) -> &mut HashMap<String, Arc<Capability>> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::Agent => &mut self.agents,
        }
    }

    fn insert(&mut self, capability: Capability) -> EntryKey {
        let key = (capability.kind(), capability.name().to_string());
        self.of_mut(key.0).insert(key.1.clone(), Arc::new(capability));
        key
    }

    fn describe(&self, kind: CapabilityKind) -> Vec<CapabilityDescriptor> {
        let mut out: Vec<CapabilityDescriptor> =
            self.of(kind).values().map(|c| c.describe()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Point-in-time view of every namespace (descriptions and schemas only).
///
/// Serializes to the `list_all` response shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub tools: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub resources: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub agents: Vec<CapabilityDescriptor>,
}

impl RegistrySnapshot {
    pub fn of(&self, kind: CapabilityKind) -> &[CapabilityDescriptor] {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Agent => &self.agents,
        }
    }

    /// Total number of entries across namespaces.
    pub fn len(&self) -> usize {
        self.tools.len() + self.resources.len() + self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Thread-safe capability store shared by every router component.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Namespaces>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a capability (last write wins).
    pub fn register(&self, capability: Capability) {
        let (kind, name) = self.inner.write().insert(capability);
        tracing::debug!(kind = %kind, name = %name, "registered capability");
    }

    /// Insert a batch under a single lock acquisition.
    pub fn register_all(&self, capabilities: impl IntoIterator<Item = Capability>) -> Vec<EntryKey> {
        let mut inner = self.inner.write();
        capabilities.into_iter().map(|c| inner.insert(c)).collect()
    }

    /// Remove an entry. Returns `false` if it was not present.
    pub fn remove(&self, kind: CapabilityKind, name: &str) -> bool {
        self.inner.write().of_mut(kind).remove(name).is_some()
    }

    pub fn get(&self, kind: CapabilityKind, name: &str) -> Option<Arc<Capability>> {
        self.inner.read().of(kind).get(name).cloned()
    }

    pub fn contains(&self, kind: CapabilityKind, name: &str) -> bool {
        self.inner.read().of(kind).contains_key(name)
    }

    /// Current names in one namespace, sorted.
    pub fn list(&self, kind: CapabilityKind) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().of(kind).keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of entries across all namespaces.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.tools.len() + inner.resources.len() + inner.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent view across all namespaces.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        RegistrySnapshot {
            tools: inner.describe(CapabilityKind::Tool),
            resources: inner.describe(CapabilityKind::Resource),
            agents: inner.describe(CapabilityKind::Agent),
        }
    }

    /// Remove every entry, in every namespace, whose name starts with `prefix`.
    pub fn purge_prefix(&self, prefix: &str) -> Vec<EntryKey> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        for kind in CapabilityKind::ALL {
            let map = inner.of_mut(kind);
            let doomed: Vec<String> = map
                .keys()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect();
            for name in doomed {
                map.remove(&name);
                removed.push((kind, name));
            }
        }
        removed
    }

    /// Swap one generation of entries for another atomically.
    ///
    /// Readers observe either all of `old` or all of `new`, never a mix.
    pub fn replace_generation(
        &self,
        old: &[EntryKey],
        new: impl IntoIterator<Item = Capability>,
    ) -> Vec<EntryKey> {
        let mut inner = self.inner.write();
        for (kind, name) in old {
            inner.of_mut(*kind).remove(name);
        }
        new.into_iter().map(|c| inner.insert(c)).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ParameterSpec;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn tool(name: &str) -> Capability {
        Capability::tool(name, format!("{name} tool"), |_| async { Ok(json!(null)) })
    }

    fn resource(name: &str) -> Capability {
        Capability::resource(name, "", |_| async { Ok(json!("data")) })
    }

    fn agent(name: &str) -> Capability {
        Capability::agent(name, "", |_| async { Ok(json!("done")) })
    }

    #[test]
    fn test_list_reflects_last_operation() {
        let registry = Registry::new();
        let mut expected = BTreeSet::new();
        let ops: &[(&str, bool)] = &[
            ("a", true),
            ("b", true),
            ("a", false),
            ("c", true),
            ("b", true),
            ("c", false),
            ("d", false),
            ("a", true),
        ];
        for (name, register) in ops {
            if *register {
                registry.register(tool(name));
                expected.insert(name.to_string());
            } else {
                registry.remove(CapabilityKind::Tool, name);
                expected.remove(*name);
            }
        }
        let listed: BTreeSet<String> = registry.list(CapabilityKind::Tool).into_iter().collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_register_overwrites() {
        let registry = Registry::new();
        registry.register(tool("x"));
        registry.register(Capability::tool("x", "second", |_| async { Ok(json!(2)) }));
        assert_eq!(registry.list(CapabilityKind::Tool), vec!["x"]);
        let cap = registry.get(CapabilityKind::Tool, "x").unwrap();
        assert_eq!(cap.description(), "second");
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let registry = Registry::new();
        assert!(!registry.remove(CapabilityKind::Agent, "ghost"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_namespaces_are_independent() {
        let registry = Registry::new();
        registry.register(tool("same"));
        registry.register(resource("same"));
        assert!(registry.remove(CapabilityKind::Tool, "same"));
        assert!(registry.contains(CapabilityKind::Resource, "same"));
        assert!(!registry.contains(CapabilityKind::Tool, "same"));
    }

    #[test]
    fn test_snapshot_shape() {
        let registry = Registry::new();
        registry.register(tool("t1").with_parameters(vec![ParameterSpec::required("p", "str")]));
        registry.register(resource("r1"));
        registry.register(agent("a1"));

        let snap = registry.snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["tools"][0]["name"], "t1");
        assert_eq!(json["tools"][0]["parameters"][0]["name"], "p");
        assert_eq!(json["resources"][0]["name"], "r1");
        assert_eq!(json["agents"][0]["name"], "a1");
        assert_eq!(snap.len(), 3);
    }

    #[tokio::test]
    async fn test_get_returns_invocable_handle() {
        let registry = Registry::new();
        registry.register(Capability::tool("add", "", |args| async move {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }));
        let cap = registry.get(CapabilityKind::Tool, "add").unwrap();
        // The registry stays usable while the handle is held.
        registry.register(tool("other"));
        assert_eq!(cap.invoke(json!({"a": 2, "b": 3})).await.unwrap(), json!(5));
    }

    #[test]
    fn test_purge_prefix_only_touches_prefixed_names() {
        let registry = Registry::new();
        registry.register(tool("ALPHA_summarize"));
        registry.register(resource("ALPHA_docs"));
        registry.register(agent("ALPHA_writer"));
        registry.register(tool("ALPHABET_x"));
        registry.register(tool("BETA_summarize"));
        registry.register(tool("summarize"));

        let removed = registry.purge_prefix("ALPHA_");
        assert_eq!(removed.len(), 3);
        assert_eq!(
            registry.list(CapabilityKind::Tool),
            vec!["ALPHABET_x", "BETA_summarize", "summarize"]
        );
        assert!(registry.list(CapabilityKind::Resource).is_empty());
        assert!(registry.list(CapabilityKind::Agent).is_empty());
    }

    #[test]
    fn test_replace_generation() {
        let registry = Registry::new();
        let old = registry.register_all(vec![tool("g1_a"), tool("g1_b"), resource("g1_r")]);
        registry.register(tool("unrelated"));

        let new = registry.replace_generation(&old, vec![tool("g2_a")]);
        assert_eq!(new, vec![(CapabilityKind::Tool, "g2_a".to_string())]);
        assert_eq!(registry.list(CapabilityKind::Tool), vec!["g2_a", "unrelated"]);
        assert!(registry.list(CapabilityKind::Resource).is_empty());
    }

    #[test]
    fn test_snapshot_never_mixes_record_fields() {
        // Each generation couples its description to its parameter count;
        // a torn read would show a description with the wrong schema.
        let registry = Arc::new(Registry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..500usize {
                    let params = (0..i % 7)
                        .map(|n| ParameterSpec::optional(&format!("p{n}"), "int"))
                        .collect();
                    registry.register(
                        Capability::tool("shared", format!("{}", i % 7), |_| async {
                            Ok(json!(null))
                        })
                        .with_parameters(params),
                    );
                }
            })
        };

        for _ in 0..500 {
            let snap = registry.snapshot();
            for desc in &snap.tools {
                let count: usize = desc.description.parse().unwrap();
                assert_eq!(desc.parameters.len(), count);
            }
        }
        writer.join().unwrap();
    }
}
