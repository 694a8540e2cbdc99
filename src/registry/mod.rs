//! Capability registry: the single store every router component shares.
//!
//! This module handles:
//! - Capability records (tools, resources, agents) with schemas and handlers
//! - Three name-spaced maps behind one lock
//! - Atomic snapshots, prefix purges, and generation swaps for hot reload

pub mod capability;
pub mod errors;
pub mod store;

pub use capability::{
    into_map, Capability, CapabilityDescriptor, CapabilityKind, CapabilityMap, Handler,
    ParameterSpec,
};
pub use errors::InvokeError;
pub use store::{EntryKey, Registry, RegistrySnapshot};
