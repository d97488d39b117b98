//! Gateway edge wire protocol — external client to gateway frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fault::{Fault, FaultFrame};
use crate::mesh::Stats;

/// Notification target. Today a gateway connection id; the shape leaves room
/// for identity- or subscription-based addressing later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
}

/// Payload of the gateway's internal `notify` operation, sent by services
/// that want to push a message to an external connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNotification {
    pub recipient: Recipient,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub payload: Value,
}

/// Frames sent by an external client to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Request {
        id: u64,
        domain: String,
        method: String,
        payload: Value,
    },
}

/// Frames sent by the gateway to an external client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Unary response to a request.
    Response { id: u64, payload: Value, stats: Stats },
    /// One element of a streaming response.
    StreamItem { id: u64, payload: Value },
    /// Explicit end of a streaming response.
    StreamEnd { id: u64 },
    /// The request was rejected or its handler failed.
    Fault {
        id: u64,
        #[serde(flatten)]
        frame: FaultFrame,
    },
    /// Unsolicited server-to-client notification.
    Notification {
        domain: String,
        method: String,
        payload: Value,
    },
}

impl ServerFrame {
    pub fn fault(id: u64, fault: &Fault) -> Self {
        Self::Fault {
            id,
            frame: fault.frame(),
        }
    }
}
