//! Container runtime CLI wrapper (`docker` by default).
//!
//! Only three subcommands are used: `run -d`, `logs --tail`, and `rm -f`.
//! Every invocation is bounded by the launch timeout.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

use super::errors::DownstreamError;

/// Lines of container output attached to handshake failures.
pub const LOG_TAIL_LINES: usize = 50;

/// Pick a currently unused local TCP port.
///
/// The port is released before returning, so another process could claim
/// it before the container binds it.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    program: String,
    container_port: u16,
    timeout: Duration,
}

impl ContainerRuntime {
    pub fn new(program: impl Into<String>, container_port: u16, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            container_port,
            timeout,
        }
    }

    /// Build the argv for `run -d -p <host_port>:<container_port> [extra..] <image>`.
    pub fn run_args(&self, host_port: u16, image: &str, extra_args: &[String]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "-p".to_string(),
            format!("{host_port}:{}", self.container_port),
        ];
        args.extend(extra_args.iter().cloned());
        args.push(image.to_string());
        args
    }

    /// Launch a detached container and return its id.
    pub async fn run_detached(
        &self,
        name: &str,
        host_port: u16,
        image: &str,
        extra_args: &[String],
    ) -> Result<String, DownstreamError> {
        let args = self.run_args(host_port, image, extra_args);
        tracing::info!(
            downstream = name,
            command = %format!("{} {}", self.program, args.join(" ")),
            "launching container"
        );

        let output = self.exec(name, "container launch", &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(downstream = name, %image, %stderr, "container launch failed");
            return Err(DownstreamError::LaunchFailed {
                name: name.to_string(),
                stderr,
            });
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(DownstreamError::LaunchFailed {
                name: name.to_string(),
                stderr: "runtime printed no container id".into(),
            });
        }
        tracing::info!(downstream = name, container_id = %id, "container started");
        Ok(id)
    }

    /// Last lines of the container's output, best effort.
    pub async fn logs_tail(&self, name: &str, id: &str) -> String {
        let args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            LOG_TAIL_LINES.to_string(),
            id.to_string(),
        ];
        match self.exec(name, "container logs", &args).await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                text.trim().to_string()
            }
            Err(e) => format!("(could not read container logs: {e})"),
        }
    }

    /// Force-remove a container. Failures are logged, not returned.
    pub async fn remove(&self, name: &str, id: &str) {
        tracing::info!(downstream = name, container_id = %id, "removing container");
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        match self.exec(name, "container removal", &args).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::warn!(
                downstream = name,
                container_id = %id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "container removal failed"
            ),
            Err(e) => tracing::warn!(
                downstream = name,
                container_id = %id,
                error = %e,
                "container removal failed"
            ),
        }
    }

    async fn exec(
        &self,
        name: &str,
        operation: &str,
        args: &[String],
    ) -> Result<Output, DownstreamError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DownstreamError::LaunchFailed {
                name: name.to_string(),
                stderr: format!("failed to run '{}': {e}", self.program),
            }),
            Err(_) => Err(DownstreamError::Timeout {
                name: name.to_string(),
                operation: operation.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_layout() {
        let runtime = ContainerRuntime::new("docker", 3456, Duration::from_secs(5));
        let args = runtime.run_args(
            40001,
            "myorg/remote:latest",
            &["--env".to_string(), "X=1".to_string()],
        );
        assert_eq!(
            args,
            vec!["run", "-d", "-p", "40001:3456", "--env", "X=1", "myorg/remote:latest"]
        );
    }

    #[test]
    fn test_find_free_port() {
        let port = find_free_port().unwrap();
        assert!(port > 0);
    }

    #[cfg(unix)]
    mod fake_runtime {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use tempfile::TempDir;

        pub(crate) fn script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-runtime");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn runtime(path: &PathBuf) -> ContainerRuntime {
            ContainerRuntime::new(path.display().to_string(), 3456, Duration::from_secs(5))
        }

        #[tokio::test]
        async fn test_run_detached_returns_id() {
            let dir = TempDir::new().unwrap();
            let path = script(&dir, "echo 'abc123'");
            let id = runtime(&path)
                .run_detached("svc", 40000, "img:tag", &[])
                .await
                .unwrap();
            assert_eq!(id, "abc123");
        }

        #[tokio::test]
        async fn test_run_detached_surfaces_stderr() {
            let dir = TempDir::new().unwrap();
            let path = script(&dir, "echo 'no such image' >&2; exit 1");
            let err = runtime(&path)
                .run_detached("svc", 40000, "img:tag", &[])
                .await
                .unwrap_err();
            assert!(matches!(err, DownstreamError::LaunchFailed { .. }));
            assert!(err.to_string().contains("no such image"));
        }

        #[tokio::test]
        async fn test_missing_runtime_binary() {
            let runtime =
                ContainerRuntime::new("/no/such/runtime", 3456, Duration::from_secs(5));
            let err = runtime
                .run_detached("svc", 40000, "img:tag", &[])
                .await
                .unwrap_err();
            assert!(err.to_string().contains("/no/such/runtime"));
        }

        #[tokio::test]
        async fn test_logs_tail_and_remove() {
            let dir = TempDir::new().unwrap();
            let record = dir.path().join("calls");
            let path = script(
                &dir,
                &format!("echo \"$@\" >> '{}'; echo 'listening on 3456'", record.display()),
            );
            let runtime = runtime(&path);

            let logs = runtime.logs_tail("svc", "abc123").await;
            assert_eq!(logs, "listening on 3456");
            runtime.remove("svc", "abc123").await;

            let calls = std::fs::read_to_string(&record).unwrap();
            assert!(calls.contains("logs --tail 50 abc123"));
            assert!(calls.contains("rm -f abc123"));
        }
    }
}
