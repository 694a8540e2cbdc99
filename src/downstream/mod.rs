//! Downstream peers: local child processes and remote TCP services.
//!
//! This module handles:
//! - Launching local peers and talking to them over stdio
//! - Attaching to running services, or launching them in containers first
//! - The discovery handshake and prefixed proxy registration
//! - Disconnect with prefix purge and container cleanup

pub mod container;
pub mod errors;
pub mod manager;
pub mod proxy;
pub mod stdio;
pub mod tcp;

pub use container::ContainerRuntime;
pub use errors::DownstreamError;
pub use manager::{DownstreamList, DownstreamManager, LocalAttachment, RemoteAttachment};
pub use proxy::{prefix_for, Connector, Discovered};
pub use stdio::{LocalCommand, StdioConnector};
pub use tcp::TcpConnector;
