//! Trellis gateway layer.
//!
//! [`ApiService`] terminates external WebSocket connections and bridges them
//! into the domain-addressed mesh: inbound calls become internal calls
//! carrying a context derived from connection state, outbound notifications
//! are routed back to the originating connection. [`ApiClient`] is the
//! external-facing counterpart used by clients outside the mesh.

pub mod client;
pub mod server;

pub use client::{ApiClient, ApiReply, ApiReplyStream, NotifyCallback};
pub use server::{ApiService, ConnectionAttributes, GatewayConfig, PayloadTransform, TlsConfig};
