//! Capability invocation error types.

use thiserror::Error;

/// Errors a capability handler can report back to the dispatcher.
///
/// None of these are fatal: the server turns every variant into an
/// `{"error": ...}` response and keeps the connection open.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Arguments were missing a required parameter or had the wrong shape.
    #[error("invalid arguments for '{capability}': {reason}")]
    InvalidArguments { capability: String, reason: String },

    /// A downstream peer answered with its own `{"error": ...}` object.
    #[error("{message}")]
    Remote { message: String },

    /// The downstream transport failed (dropped pipe, reset socket, bad line).
    #[error("downstream '{downstream}' unavailable: {reason}")]
    Downstream { downstream: String, reason: String },

    /// Any other failure raised by a local handler.
    #[error("{reason}")]
    Failed { reason: String },
}

impl InvokeError {
    /// Shorthand for a local handler failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        InvokeError::Failed {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for InvokeError {
    fn from(e: serde_json::Error) -> Self {
        InvokeError::Failed {
            reason: format!("serialization error: {e}"),
        }
    }
}
