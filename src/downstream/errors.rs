//! Downstream connection error types.

use thiserror::Error;

use crate::registry::InvokeError;

/// Errors that can occur while connecting to, talking to, or tearing down
/// a downstream peer.
#[derive(Debug, Error)]
pub enum DownstreamError {
    /// The downstream name cannot produce a usable prefix.
    #[error("invalid downstream name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// The name is already tracked by the other connection kind.
    #[error("downstream name '{name}' is already used by a {kind} connection")]
    NameInUse { name: String, kind: String },

    /// The local command line is empty or unusable.
    #[error("invalid command for downstream '{name}': {reason}")]
    InvalidCommand { name: String, reason: String },

    /// A child process failed to start.
    #[error("failed to spawn downstream '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The TCP connection could not be established.
    #[error("failed to connect to downstream '{name}' at {addr}: {reason}")]
    ConnectFailed {
        name: String,
        addr: String,
        reason: String,
    },

    /// The `list_all` discovery exchange failed.
    #[error("downstream '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// I/O failure on the pipe or socket.
    #[error("transport error for downstream '{name}': {reason}")]
    Transport { name: String, reason: String },

    /// The peer answered with a line that is not valid JSON.
    #[error("malformed response from downstream '{name}': {reason}")]
    MalformedResponse { name: String, reason: String },

    /// The connector was stopped or closed.
    #[error("downstream '{name}' is not connected")]
    NotConnected { name: String },

    /// The container launch command exited non-zero.
    #[error("container launch for downstream '{name}' failed: {stderr}")]
    LaunchFailed { name: String, stderr: String },

    /// A bounded external operation did not finish in time.
    #[error("{operation} for downstream '{name}' timed out after {timeout_ms}ms")]
    Timeout {
        name: String,
        operation: String,
        timeout_ms: u64,
    },
}

impl DownstreamError {
    /// Name of the downstream the error belongs to.
    pub fn downstream(&self) -> &str {
        match self {
            DownstreamError::InvalidName { name, .. }
            | DownstreamError::NameInUse { name, .. }
            | DownstreamError::InvalidCommand { name, .. }
            | DownstreamError::SpawnFailed { name, .. }
            | DownstreamError::ConnectFailed { name, .. }
            | DownstreamError::HandshakeFailed { name, .. }
            | DownstreamError::Transport { name, .. }
            | DownstreamError::MalformedResponse { name, .. }
            | DownstreamError::NotConnected { name }
            | DownstreamError::LaunchFailed { name, .. }
            | DownstreamError::Timeout { name, .. } => name,
        }
    }
}

impl From<DownstreamError> for InvokeError {
    fn from(e: DownstreamError) -> Self {
        InvokeError::Downstream {
            downstream: e.downstream().to_string(),
            reason: e.to_string(),
        }
    }
}
