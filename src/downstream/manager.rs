//! Downstream lifecycle orchestration.
//!
//! Tracks every live connector by its caller-chosen name. Connect runs the
//! discovery handshake and registers prefixed proxies; disconnect stops the
//! connector and purges everything under its prefix. Connect and disconnect
//! are serialized per prefix: two operations on the same name cannot
//! interleave, while unrelated downstreams proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use super::container::{find_free_port, ContainerRuntime};
use super::errors::DownstreamError;
use super::proxy::{handshake, prefix_for, validate_name, Connector};
use super::stdio::{LocalCommand, StdioConnector};
use super::tcp::TcpConnector;
use crate::config::DownstreamConfig;
use crate::registry::{EntryKey, Registry};

// ─── Public Types ────────────────────────────────────────────────────────────

/// Result of a local connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalAttachment {
    pub name: String,
    pub prefix: String,
    pub pid: Option<u32>,
    pub capabilities: usize,
    /// `true` when the name was already connected and nothing was started.
    pub already_connected: bool,
}

/// Result of a service attach or container launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteAttachment {
    pub name: String,
    pub prefix: String,
    pub addr: String,
    pub container_id: Option<String>,
    pub capabilities: usize,
    pub already_connected: bool,
}

/// Names of tracked downstreams, by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownstreamList {
    pub local: Vec<String>,
    pub remote: Vec<String>,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

struct LocalEntry {
    connector: Arc<StdioConnector>,
    capabilities: usize,
}

struct RemoteEntry {
    connector: Arc<TcpConnector>,
    container_id: Option<String>,
    capabilities: usize,
}

pub struct DownstreamManager {
    registry: Arc<Registry>,
    settings: DownstreamConfig,
    runtime: ContainerRuntime,
    local: Mutex<HashMap<String, LocalEntry>>,
    remote: Mutex<HashMap<String, RemoteEntry>>,
    /// One lifecycle lock per prefix, created on first use.
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DownstreamManager {
    pub fn new(registry: Arc<Registry>, settings: DownstreamConfig) -> Self {
        let runtime = ContainerRuntime::new(
            settings.container_runtime.clone(),
            settings.container_port,
            settings.launch_timeout(),
        );
        Self {
            registry,
            settings,
            runtime,
            local: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ─── Local ───────────────────────────────────────────────────────────

    /// Launch `command` as a child process and import its capabilities
    /// under `NAME_`.
    pub async fn connect_local(
        &self,
        name: &str,
        command: &LocalCommand,
    ) -> Result<LocalAttachment, DownstreamError> {
        validate_name(name)?;
        let _guard = self.lock_name(name).await;
        let prefix = prefix_for(name);

        if let Some(entry) = self.local.lock().get(name) {
            tracing::warn!(downstream = name, "local downstream already connected");
            return Ok(LocalAttachment {
                name: name.to_string(),
                prefix,
                pid: entry.connector.pid(),
                capabilities: entry.capabilities,
                already_connected: true,
            });
        }
        self.ensure_not_remote(name)?;

        tracing::info!(downstream = name, command = %command.display(), "connecting local downstream");
        let connector = Arc::new(StdioConnector::spawn(name, command)?);

        let keys = match self.run_handshake(connector.clone(), &prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                connector.stop(self.settings.stop_grace()).await;
                let tail = connector.stderr_tail();
                tracing::error!(downstream = name, error = %e, "local downstream handshake failed");
                return Err(with_diagnostics(name, e, "stderr", &tail));
            }
        };

        let attachment = LocalAttachment {
            name: name.to_string(),
            prefix,
            pid: connector.pid(),
            capabilities: keys.len(),
            already_connected: false,
        };
        self.local.lock().insert(
            name.to_string(),
            LocalEntry {
                connector,
                capabilities: keys.len(),
            },
        );
        Ok(attachment)
    }

    /// Stop a local downstream and purge its capabilities.
    ///
    /// Returns `false` if `name` was not a tracked local downstream.
    pub async fn disconnect_local(&self, name: &str) -> bool {
        let _guard = self.lock_name(name).await;
        let Some(entry) = self.local.lock().remove(name) else {
            tracing::debug!(downstream = name, "disconnect_local: not connected");
            return false;
        };

        tracing::info!(downstream = name, "disconnecting local downstream");
        entry.connector.stop(self.settings.stop_grace()).await;
        self.purge(name);
        true
    }

    // ─── Remote ──────────────────────────────────────────────────────────

    /// Attach to a service that is already running at `host:port`.
    ///
    /// Connecting a name that is already attached warns and returns the
    /// existing attachment.
    pub async fn connect_service(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<RemoteAttachment, DownstreamError> {
        validate_name(name)?;
        let _guard = self.lock_name(name).await;

        if let Some(existing) = self.existing_remote(name) {
            return Ok(existing);
        }
        self.ensure_not_local(name)?;

        tracing::info!(downstream = name, %host, port, "connecting to existing service");
        let (connector, keys) = self.attach_tcp(name, host, port).await?;
        Ok(self.track_remote(name, connector, None, keys.len()))
    }

    /// Launch `image` in a container publishing its protocol port on a free
    /// local port, then attach to it.
    pub async fn connect_remote_docker(
        &self,
        name: &str,
        image: &str,
        extra_args: &[String],
    ) -> Result<RemoteAttachment, DownstreamError> {
        validate_name(name)?;
        let _guard = self.lock_name(name).await;

        if let Some(existing) = self.existing_remote(name) {
            return Ok(existing);
        }
        self.ensure_not_local(name)?;

        tracing::info!(downstream = name, %image, "connecting remote downstream");
        let host_port = find_free_port().map_err(|e| DownstreamError::LaunchFailed {
            name: name.to_string(),
            stderr: format!("could not allocate a local port: {e}"),
        })?;
        let container_id = self
            .runtime
            .run_detached(name, host_port, image, extra_args)
            .await?;

        tokio::time::sleep(self.settings.container_settle()).await;

        match self.attach_tcp(name, "127.0.0.1", host_port).await {
            Ok((connector, keys)) => {
                Ok(self.track_remote(name, connector, Some(container_id), keys.len()))
            }
            Err(e) => {
                let logs = self.runtime.logs_tail(name, &container_id).await;
                self.runtime.remove(name, &container_id).await;
                tracing::error!(downstream = name, error = %e, "remote downstream attach failed");
                Err(with_diagnostics(name, e, "container logs", &logs))
            }
        }
    }

    /// Close a remote downstream, purge its capabilities, and remove its
    /// container if the router launched one.
    ///
    /// Returns `false` if `name` was not a tracked remote downstream.
    pub async fn disconnect_remote(&self, name: &str) -> bool {
        let _guard = self.lock_name(name).await;
        let Some(entry) = self.remote.lock().remove(name) else {
            tracing::debug!(downstream = name, "disconnect_remote: not connected");
            return false;
        };

        tracing::info!(downstream = name, "disconnecting remote downstream");
        entry.connector.close().await;
        self.purge(name);
        if let Some(id) = entry.container_id {
            self.runtime.remove(name, &id).await;
        }
        true
    }

    // ─── Inspection / shutdown ───────────────────────────────────────────

    pub fn list_downstreams(&self) -> DownstreamList {
        let mut local: Vec<String> = self.local.lock().keys().cloned().collect();
        let mut remote: Vec<String> = self.remote.lock().keys().cloned().collect();
        local.sort();
        remote.sort();
        DownstreamList { local, remote }
    }

    /// Disconnect everything. Used on shutdown.
    pub async fn disconnect_all(&self) {
        let list = self.list_downstreams();
        for name in &list.local {
            self.disconnect_local(name).await;
        }
        for name in &list.remote {
            self.disconnect_remote(name).await;
        }
        if !list.local.is_empty() || !list.remote.is_empty() {
            tracing::info!(
                local = list.local.len(),
                remote = list.remote.len(),
                "all downstreams disconnected"
            );
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// Serialize lifecycle operations on names sharing a prefix.
    async fn lock_name(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.lifecycle.lock().entry(prefix_for(name)).or_default());
        lock.lock_owned().await
    }

    async fn run_handshake(
        &self,
        connector: Arc<dyn Connector>,
        prefix: &str,
    ) -> Result<Vec<EntryKey>, DownstreamError> {
        let timeout = self.settings.handshake_timeout();
        let name = connector.name().to_string();
        match tokio::time::timeout(timeout, handshake(connector, prefix, &self.registry)).await {
            Ok(result) => result,
            Err(_) => Err(DownstreamError::Timeout {
                name,
                operation: "handshake".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn attach_tcp(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<(Arc<TcpConnector>, Vec<EntryKey>), DownstreamError> {
        let connector = Arc::new(
            TcpConnector::connect(name, host, port, self.settings.connect_timeout()).await?,
        );
        match self.run_handshake(connector.clone(), &prefix_for(name)).await {
            Ok(keys) => Ok((connector, keys)),
            Err(e) => {
                connector.close().await;
                Err(e)
            }
        }
    }

    fn track_remote(
        &self,
        name: &str,
        connector: Arc<TcpConnector>,
        container_id: Option<String>,
        capabilities: usize,
    ) -> RemoteAttachment {
        let attachment = RemoteAttachment {
            name: name.to_string(),
            prefix: prefix_for(name),
            addr: connector.addr().to_string(),
            container_id: container_id.clone(),
            capabilities,
            already_connected: false,
        };
        self.remote.lock().insert(
            name.to_string(),
            RemoteEntry {
                connector,
                container_id,
                capabilities,
            },
        );
        attachment
    }

    fn existing_remote(&self, name: &str) -> Option<RemoteAttachment> {
        let remote = self.remote.lock();
        let entry = remote.get(name)?;
        tracing::warn!(downstream = name, "remote downstream already connected");
        Some(RemoteAttachment {
            name: name.to_string(),
            prefix: prefix_for(name),
            addr: entry.connector.addr().to_string(),
            container_id: entry.container_id.clone(),
            capabilities: entry.capabilities,
            already_connected: true,
        })
    }

    fn ensure_not_local(&self, name: &str) -> Result<(), DownstreamError> {
        if self.local.lock().contains_key(name) {
            return Err(DownstreamError::NameInUse {
                name: name.to_string(),
                kind: "local".into(),
            });
        }
        Ok(())
    }

    fn ensure_not_remote(&self, name: &str) -> Result<(), DownstreamError> {
        if self.remote.lock().contains_key(name) {
            return Err(DownstreamError::NameInUse {
                name: name.to_string(),
                kind: "remote".into(),
            });
        }
        Ok(())
    }

    fn purge(&self, name: &str) {
        let removed = self.registry.purge_prefix(&prefix_for(name));
        tracing::info!(downstream = name, removed = removed.len(), "purged downstream capabilities");
    }
}

/// Attach captured process or container output to a handshake failure.
fn with_diagnostics(
    name: &str,
    error: DownstreamError,
    label: &str,
    output: &str,
) -> DownstreamError {
    if output.trim().is_empty() {
        return error;
    }
    DownstreamError::HandshakeFailed {
        name: name.to_string(),
        reason: format!("{error}\n--- {label} ---\n{output}"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::{Capability, CapabilityKind};
    use serde_json::{json, Value};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// A shell peer reporting tool `summarize` and resource `docs`.
    const ALPHA_PEER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *list_all*) echo '{"tools":[{"name":"summarize","parameters":[{"name":"text","type":"str","required":true}]}],"resources":[{"name":"docs"}],"agents":[]}' ;;
    *run_tool*) echo '{"ok":true,"result":"short"}' ;;
    *) echo '{"error":"unsupported"}' ;;
  esac
done
"#;

    fn settings() -> DownstreamConfig {
        DownstreamConfig {
            container_settle_ms: 10,
            launch_timeout_secs: 5,
            connect_timeout_ms: 2000,
            handshake_timeout_secs: 5,
            stop_grace_ms: 500,
            ..DownstreamConfig::default()
        }
    }

    fn manager() -> DownstreamManager {
        DownstreamManager::new(Arc::new(Registry::new()), settings())
    }

    fn sh(script: &str) -> LocalCommand {
        LocalCommand::from_argv(&["sh", "-c", script]).unwrap()
    }

    fn fake_runtime(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-runtime");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Serve the protocol on an ephemeral port with a fixed handshake.
    async fn serve_peer(handshake: Value) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handshake = handshake.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = if line.contains("list_all") {
                            handshake.clone()
                        } else {
                            json!({"ok": true, "result": "remote"})
                        };
                        let mut out = reply.to_string();
                        out.push('\n');
                        if write.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_connect_local_registers_prefixed_names() {
        let mgr = manager();
        let attachment = mgr.connect_local("alpha", &sh(ALPHA_PEER)).await.unwrap();
        assert_eq!(attachment.prefix, "ALPHA_");
        assert_eq!(attachment.capabilities, 2);
        assert!(!attachment.already_connected);

        let registry = mgr.registry();
        assert!(registry.contains(CapabilityKind::Tool, "ALPHA_summarize"));
        assert!(!registry.contains(CapabilityKind::Tool, "summarize"));
        assert!(registry.contains(CapabilityKind::Resource, "ALPHA_docs"));

        let tool = registry.get(CapabilityKind::Tool, "ALPHA_summarize").unwrap();
        let result = tool.invoke(json!({"text": "a long text"})).await.unwrap();
        assert_eq!(result, json!("short"));

        assert_eq!(mgr.list_downstreams().local, vec!["alpha"]);
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_disconnect_local_purges_only_its_prefix() {
        let mgr = manager();
        let registry = mgr.registry().clone();
        registry.register(Capability::tool("keep", "", |_| async { Ok(json!(1)) }));
        registry.register(Capability::agent("BETA_x", "", |_| async { Ok(json!(1)) }));

        mgr.connect_local("alpha", &sh(ALPHA_PEER)).await.unwrap();
        registry.register(Capability::agent("ALPHA_extra", "", |_| async { Ok(json!(1)) }));

        assert!(mgr.disconnect_local("alpha").await);
        for kind in CapabilityKind::ALL {
            assert!(registry.list(kind).iter().all(|n| !n.starts_with("ALPHA_")));
        }
        assert!(registry.contains(CapabilityKind::Tool, "keep"));
        assert!(registry.contains(CapabilityKind::Agent, "BETA_x"));
        assert!(mgr.list_downstreams().local.is_empty());

        assert!(!mgr.disconnect_local("alpha").await);
    }

    #[tokio::test]
    async fn test_reconnect_same_name_is_noop() {
        let mgr = manager();
        let first = mgr.connect_local("alpha", &sh(ALPHA_PEER)).await.unwrap();
        let second = mgr.connect_local("alpha", &sh("exit 1")).await.unwrap();
        assert!(second.already_connected);
        assert_eq!(second.pid, first.pid);
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_handshake_failure_includes_stderr() {
        let mgr = manager();
        let err = mgr
            .connect_local("broken", &sh("echo 'fatal: missing config' >&2; exit 3"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fatal: missing config"), "{err}");
        assert!(mgr.list_downstreams().local.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let mgr = manager();
        let err = mgr.connect_local("", &sh(ALPHA_PEER)).await.unwrap_err();
        assert!(matches!(err, DownstreamError::InvalidName { .. }));
        let err = mgr.connect_service("a b", "127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, DownstreamError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn test_connect_service_and_disconnect() {
        let port = serve_peer(json!({"tools": [{"name": "query"}], "agents": [{"name": "analyst"}]})).await;
        let mgr = manager();

        let attachment = mgr.connect_service("svc", "127.0.0.1", port).await.unwrap();
        assert_eq!(attachment.capabilities, 2);
        assert!(attachment.container_id.is_none());

        let again = mgr.connect_service("svc", "127.0.0.1", port).await.unwrap();
        assert!(again.already_connected);

        let registry = mgr.registry().clone();
        let tool = registry.get(CapabilityKind::Tool, "SVC_query").unwrap();
        assert_eq!(tool.invoke(json!({})).await.unwrap(), json!("remote"));

        assert!(mgr.disconnect_remote("svc").await);
        assert!(!registry.contains(CapabilityKind::Agent, "SVC_analyst"));
        assert!(!mgr.disconnect_remote("svc").await);

        // The proxy held by a caller now fails cleanly.
        assert!(tool.invoke(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_service_named_by_address() {
        let port = serve_peer(json!({"tools": [{"name": "query"}]})).await;
        let mgr = manager();

        let attachment = mgr
            .connect_service("127.0.0.1", "127.0.0.1", port)
            .await
            .unwrap();
        assert_eq!(attachment.prefix, "127.0.0.1_");
        assert!(mgr.registry().contains(CapabilityKind::Tool, "127.0.0.1_query"));

        // An unreachable address fails at connect, not at validation.
        let err = mgr.connect_service("localhost", "127.0.0.1", 1).await.unwrap_err();
        assert!(!matches!(err, DownstreamError::InvalidName { .. }), "{err}");

        assert!(mgr.disconnect_remote("127.0.0.1").await);
        assert!(!mgr.registry().contains(CapabilityKind::Tool, "127.0.0.1_query"));
    }

    #[tokio::test]
    async fn test_name_in_use_across_kinds() {
        let port = serve_peer(json!({"tools": []})).await;
        let mgr = manager();
        mgr.connect_local("alpha", &sh(ALPHA_PEER)).await.unwrap();
        let err = mgr
            .connect_service("alpha", "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, DownstreamError::NameInUse { .. }));
        mgr.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_remote_docker_launch_failure() {
        let dir = TempDir::new().unwrap();
        let runtime = fake_runtime(&dir, "echo 'no such image' >&2; exit 1");
        let mgr = DownstreamManager::new(
            Arc::new(Registry::new()),
            DownstreamConfig {
                container_runtime: runtime.display().to_string(),
                ..settings()
            },
        );

        let err = mgr
            .connect_remote_docker("svc", "img:tag", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DownstreamError::LaunchFailed { .. }));
        assert!(err.to_string().contains("no such image"));
        assert!(mgr.list_downstreams().remote.is_empty());
    }

    #[tokio::test]
    async fn test_remote_docker_attach_failure_removes_container() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("calls");
        // `run` prints an id but nothing listens on the published port.
        let runtime = fake_runtime(
            &dir,
            &format!(
                "echo \"$@\" >> '{}'\ncase \"$1\" in\n  run) echo 'c0ffee' ;;\n  logs) echo 'server crashed on boot' ;;\nesac",
                record.display()
            ),
        );
        let mgr = DownstreamManager::new(
            Arc::new(Registry::new()),
            DownstreamConfig {
                container_runtime: runtime.display().to_string(),
                ..settings()
            },
        );

        let err = mgr
            .connect_remote_docker("svc", "img:tag", &["--env".into(), "X=1".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("server crashed on boot"), "{err}");
        assert!(mgr.list_downstreams().remote.is_empty());

        let calls = std::fs::read_to_string(&record).unwrap();
        assert!(calls.contains("--env X=1 img:tag"));
        assert!(calls.contains("rm -f c0ffee"));
    }

    #[tokio::test]
    async fn test_slow_connect_does_not_block_other_names() {
        let mgr = Arc::new(manager());
        mgr.connect_local("alpha", &sh(ALPHA_PEER)).await.unwrap();

        // Never answers the handshake, so this holds its name until killed.
        let hung = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.connect_local("hung", &sh("sleep 30")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let disconnected = tokio::time::timeout(Duration::from_secs(2), mgr.disconnect_local("alpha"))
            .await
            .expect("disconnect waited behind an unrelated connect");
        assert!(disconnected);
        hung.abort();
    }

    #[tokio::test]
    async fn test_concurrent_connects_same_name() {
        let mgr = Arc::new(manager());
        let a = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.connect_local("alpha", &sh(ALPHA_PEER)).await })
        };
        let b = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.connect_local("alpha", &sh(ALPHA_PEER)).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        // Exactly one of them launched a process.
        assert_ne!(a.already_connected, b.already_connected);
        assert_eq!(mgr.list_downstreams().local.len(), 1);

        tokio::time::timeout(Duration::from_secs(10), mgr.disconnect_all())
            .await
            .unwrap();
    }
}
