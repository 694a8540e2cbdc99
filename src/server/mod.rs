//! Router server: serves the line protocol against the shared registry.
//!
//! One task per accepted connection; requests on a connection are answered
//! strictly in order, one in flight at a time.

pub mod dispatch;
pub mod errors;
pub mod listener;

pub use dispatch::{handle_line, handle_request};
pub use errors::ServerError;
pub use listener::RouterServer;
