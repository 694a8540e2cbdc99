//! TCP front end: accept loop plus one task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;
use uuid::Uuid;

use super::dispatch::handle_line;
use super::errors::ServerError;
use crate::protocol::encode_line;
use crate::registry::Registry;

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct RouterServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
}

impl RouterServer {
    /// Bind the listen socket. This is the only fatal server error.
    pub async fn bind(addr: &str, registry: Arc<Registry>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Io {
            reason: e.to_string(),
        })?;
        tracing::info!(addr = %local_addr, "router server listening");
        Ok(Self {
            listener,
            local_addr,
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the process exits.
    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Open connections are left to finish
    /// on their own tasks.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(addr = %self.local_addr, "router server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&self.registry);
                        let id = Uuid::new_v4();
                        let span = tracing::info_span!("connection", %id, %peer);
                        tokio::spawn(handle_connection(stream, registry).instrument(span));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }
}

/// Request/reply loop for one client. Returns on EOF or a socket error.
async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) {
    tracing::info!("connection opened");
    let _ = stream.set_nodelay(true);
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    let mut served = 0u64;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "read failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(request = %line, "request received");

        let response = handle_line(&registry, line).await;
        let out = match encode_line(&response) {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response");
                format!("{{\"error\":\"failed to encode response: {e}\"}}\n")
            }
        };
        if let Err(e) = write.write_all(out.as_bytes()).await {
            tracing::warn!(error = %e, "write failed");
            break;
        }
        served += 1;
    }

    tracing::info!(requests = served, "connection closed");
}

// ─── Tests ───────────────────────────────────────────────────────────────────
