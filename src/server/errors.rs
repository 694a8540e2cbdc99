//! Router server error types.

use thiserror::Error;

/// Errors that stop the server. Per-request failures never surface here;
/// they become `{"error": ...}` responses.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("server I/O error: {reason}")]
    Io { reason: String },
}
