//! Internal mesh wire protocol — service-to-service envelopes.
//!
//! Requests are published to the target domain's subject; every reply frame
//! is addressed back to the requesting instance's `origin` subject and
//! correlated by `id`. Streaming responses are a run of `streamItem` frames
//! closed by an explicit `streamEnd`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::ContextData;
use crate::fault::{Fault, FaultFrame};

/// Correlated request sent to a domain subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshRequest {
    pub id: u64,
    pub domain: String,
    /// Reply address of the requesting instance.
    pub origin: String,
    pub method: String,
    pub payload: Value,
    pub context_data: ContextData,
}

/// One response frame, either a unary response or a single stream element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshResponse {
    pub id: u64,
    pub origin: String,
    pub payload: Value,
    pub stats: Stats,
    /// The subset of the handler's context marked for merge-back.
    pub shared_context_data: ContextData,
}

/// Latency accounting attached to every response frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Stats {
    /// Elapsed handler time in milliseconds.
    pub time: f64,
}

/// Everything that moves over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Request(MeshRequest),
    /// Unary response.
    Response(MeshResponse),
    /// One element of a streaming response.
    StreamItem(MeshResponse),
    /// Explicit end of a streaming response.
    StreamEnd { id: u64, origin: String },
    /// Remote fault addressed back to the requester.
    Fault {
        id: u64,
        origin: String,
        #[serde(flatten)]
        frame: FaultFrame,
    },
}

impl Envelope {
    pub fn fault(id: u64, origin: impl Into<String>, fault: &Fault) -> Self {
        Self::Fault {
            id,
            origin: origin.into(),
            frame: fault.frame(),
        }
    }

    /// Correlation id of the exchange this envelope belongs to.
    pub fn id(&self) -> u64 {
        match self {
            Self::Request(r) => r.id,
            Self::Response(r) | Self::StreamItem(r) => r.id,
            Self::StreamEnd { id, .. } | Self::Fault { id, .. } => *id,
        }
    }
}
