//! Trellis service layer.
//!
//! A [`Service`] is one participant in the mesh: it can serve a logical
//! domain (handler registry + dispatcher) and call other domains through a
//! [`ServiceClient`]. The [`Context`] is the ambient, per-call-chain state
//! that flows transparently through nested cross-service calls.

pub mod client;
pub mod context;
pub mod handler;
pub mod service;

pub use client::{Reply, ReplyStream, ServiceClient};
pub use context::Context;
pub use handler::{Handler, HandlerReply, HandlerResult};
pub use service::{Service, ServiceConfig};
