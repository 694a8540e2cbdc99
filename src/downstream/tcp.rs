//! Remote downstreams reached over a persistent TCP connection.
//!
//! One request line is written, one response line is read. Calls are
//! serialized over the single socket. `close` wakes any in-flight call so
//! teardown never waits on a silent peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use super::errors::DownstreamError;
use super::proxy::Connector;
use crate::protocol::{encode_line, Request};

/// A persistent line-protocol connection to `host:port`.
pub struct TcpConnector {
    name: String,
    addr: String,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl TcpConnector {
    /// Open the connection, giving up after `timeout`.
    pub async fn connect(
        name: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, DownstreamError> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DownstreamError::ConnectFailed {
                    name: name.to_string(),
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DownstreamError::Timeout {
                    name: name.to_string(),
                    operation: format!("connect to {addr}"),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };
        let _ = stream.set_nodelay(true);

        tracing::info!(downstream = name, %addr, "connected to remote downstream");
        Ok(Self {
            name: name.to_string(),
            addr,
            stream: Mutex::new(Some(BufReader::new(stream))),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Close the socket. In-flight and later calls fail with `NotConnected`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_signal.notify_waiters();
        // The in-flight call (if any) drops its guard once woken.
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        tracing::info!(downstream = %self.name, addr = %self.addr, "closed remote downstream");
    }

    fn not_connected(&self) -> DownstreamError {
        DownstreamError::NotConnected {
            name: self.name.clone(),
        }
    }

    fn transport_error(&self, reason: String) -> DownstreamError {
        DownstreamError::Transport {
            name: self.name.clone(),
            reason,
        }
    }

    async fn exchange(
        &self,
        slot: &mut Option<BufReader<TcpStream>>,
        line: &str,
    ) -> Result<Value, DownstreamError> {
        let stream = slot.as_mut().ok_or_else(|| self.not_connected())?;

        let outcome: std::io::Result<String> = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await?;
            let mut reply = String::new();
            stream.read_line(&mut reply).await?;
            Ok(reply)
        }
        .await;

        let reply = match outcome {
            Ok(reply) if reply.is_empty() => {
                *slot = None;
                return Err(self.transport_error("connection closed by peer".into()));
            }
            Ok(reply) => reply,
            Err(e) => {
                *slot = None;
                return Err(self.transport_error(e.to_string()));
            }
        };

        // Anything the peer sent past the first newline is not part of this
        // reply; drop it so the next call starts clean.
        let buffered = stream.buffer().len();
        if buffered > 0 {
            tracing::debug!(
                downstream = %self.name,
                bytes = buffered,
                "discarding bytes after response line"
            );
            stream.consume(buffered);
        }

        serde_json::from_str(reply.trim()).map_err(|e| DownstreamError::MalformedResponse {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &Request) -> Result<Value, DownstreamError> {
        let line = encode_line(request)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let closed = self.close_signal.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.not_connected());
        }

        tokio::select! {
            _ = &mut closed => Err(self.not_connected()),
            result = async {
                let mut slot = self.stream.lock().await;
                if self.closed.load(Ordering::SeqCst) {
                    return Err(self.not_connected());
                }
                self.exchange(&mut slot, &line).await
            } => result,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
