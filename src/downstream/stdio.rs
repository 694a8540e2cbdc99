//! Local downstreams: a child process speaking the protocol over stdio.
//!
//! Handles:
//! - Spawning the child with piped stdin/stdout/stderr
//! - A drain task that logs stderr continuously and keeps a short tail
//!   for diagnostics
//! - Strict write-one-line / read-one-line calls
//! - Graceful stop (close stdin, bounded wait) with force-kill fallback

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::DownstreamError;
use super::proxy::Connector;
use crate::protocol::{encode_line, Request};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// How long `stop` waits for the stderr drain after the child exits.
const DRAIN_FLUSH_WAIT: Duration = Duration::from_millis(500);

// ─── Command ─────────────────────────────────────────────────────────────────

/// How to launch a local downstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl LocalCommand {
    /// Build from an argv list (`["python", "server.py", "--stdio"]`).
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        if program.as_ref().trim().is_empty() {
            return None;
        }
        Some(Self {
            command: program.as_ref().to_string(),
            args: rest.iter().map(|a| a.as_ref().to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
        })
    }

    /// Space-joined command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

struct Pipes {
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Owns one child process and its stdio pipes.
pub struct StdioConnector {
    name: String,
    pid: Option<u32>,
    pipes: Mutex<Pipes>,
    child: Mutex<Child>,
    alive: AtomicBool,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    drain: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StdioConnector {
    /// Launch the child and start draining its stderr.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(name: &str, command: &LocalCommand) -> Result<Self, DownstreamError> {
        if command.command.trim().is_empty() {
            return Err(DownstreamError::InvalidCommand {
                name: name.to_string(),
                reason: "command is empty".into(),
            });
        }

        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| DownstreamError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", command.display()),
        })?;

        let stdin = child.stdin.take().ok_or(DownstreamError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(DownstreamError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let pid = child.id();
        tracing::info!(
            downstream = name,
            pid = ?pid,
            command = %command.display(),
            "spawned local downstream"
        );

        let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        let drain = stderr.map(|stderr| {
            let name = name.to_string();
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(downstream = %name, "[stderr] {line}");
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tracing::debug!(downstream = %name, "stderr drain finished");
            })
        });

        Ok(Self {
            name: name.to_string(),
            pid,
            pipes: Mutex::new(Pipes {
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
            alive: AtomicBool::new(true),
            stderr_tail,
            drain: parking_lot::Mutex::new(drain),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Most recent stderr lines, newline-joined.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stop the child: close stdin, wait up to `grace`, then force-kill.
    pub async fn stop(&self, grace: Duration) {
        tracing::info!(downstream = %self.name, "stopping local downstream");
        self.alive.store(false, Ordering::SeqCst);

        // A call blocked on a silent child holds the pipes; skip the polite
        // EOF in that case and let the kill below unblock it.
        if let Ok(mut pipes) = self.pipes.try_lock() {
            pipes.stdin = None;
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(downstream = %self.name, %status, "local downstream exited");
            }
            _ => {
                tracing::warn!(
                    downstream = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "local downstream did not exit in time, killing"
                );
                let _ = child.kill().await;
            }
        }

        // Stderr hits EOF once the child is gone; let the drain flush its
        // last lines into the tail unless a grandchild still holds the pipe.
        let drain = self.drain.lock().take();
        if let Some(mut drain) = drain {
            if tokio::time::timeout(DRAIN_FLUSH_WAIT, &mut drain).await.is_err() {
                drain.abort();
            }
        }
    }

    fn transport_error(&self, reason: String) -> DownstreamError {
        DownstreamError::Transport {
            name: self.name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &Request) -> Result<Value, DownstreamError> {
        let line = encode_line(request).map_err(|e| {
            self.transport_error(format!("failed to serialize request: {e}"))
        })?;

        let mut pipes = self.pipes.lock().await;
        if !self.is_alive() {
            return Err(DownstreamError::NotConnected {
                name: self.name.clone(),
            });
        }
        let stdin = pipes.stdin.as_mut().ok_or(DownstreamError::NotConnected {
            name: self.name.clone(),
        })?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;

        let mut reply = String::new();
        let read = pipes
            .stdout
            .read_line(&mut reply)
            .await
            .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;
        if read == 0 {
            self.alive.store(false, Ordering::SeqCst);
            return Err(self.transport_error(
                "stdout closed (process may have exited)".into(),
            ));
        }

        serde_json::from_str(reply.trim()).map_err(|e| DownstreamError::MalformedResponse {
            name: self.name.clone(),
            reason: format!("{e}"),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
