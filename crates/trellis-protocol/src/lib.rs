//! Trellis protocol types.
//!
//! Wire shapes for the internal mesh (service-to-service traffic over the
//! pub/sub bus) and the gateway edge (external WebSocket clients), plus the
//! fault taxonomy shared by every layer. This crate is the single source of
//! truth for envelope shapes, well-known context keys, and reserved names.

pub mod api;
pub mod data;
pub mod fault;
pub mod mesh;

pub use api::{ApiNotification, ClientFrame, Recipient, ServerFrame};
pub use data::ContextData;
pub use fault::{Fault, FaultFrame, FaultKind};
pub use mesh::{Envelope, MeshRequest, MeshResponse, Stats};

/// Reserved domain of the gateway service. The leading underscore keeps it
/// unreachable from external clients while services inside the mesh can still
/// address it (e.g. to deliver notifications).
pub const GATEWAY_DOMAIN: &str = "_gateway";

/// Marker prefix for domains and methods restricted to trusted mesh peers.
pub const RESTRICTED_PREFIX: char = '_';

/// Whether a domain or method name is restricted from external access.
pub fn is_restricted(name: &str) -> bool {
    name.trim().starts_with(RESTRICTED_PREFIX)
}
