//! Trellis transport layer.
//!
//! The mesh consumes its wire transport through two seams:
//! - [`MessageBus`] — publish/subscribe addressing by subject. Delivery
//!   guarantees, reconnection policy, and message signing are properties of
//!   the implementation behind this trait, not of the mesh.
//! - [`MessageConnection`] — correlated request/response exchange on top of a
//!   bus, with per-request timeouts, streaming reply reassembly, and
//!   server-side dispatch through the [`RequestHandler`] trait.
//!
//! [`MemoryBus`] is the in-process implementation used by tests and
//! single-process deployments.

pub mod bus;
pub mod connection;
pub mod memory;

pub use bus::{BusDyn, MessageBus, Subscription};
pub use connection::{
    ConnectionConfig, FrameStream, MessageConnection, RequestHandler, RequestHandlerDyn,
    ServerReply, TransportReply,
};
pub use memory::MemoryBus;
