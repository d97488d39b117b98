//! Fault taxonomy for mesh calls.
//!
//! Every failure a caller can observe is one of these variants, so callers
//! can always discriminate "your call was invalid" (`Dispatch`) from "the
//! operation itself failed" (`Handler`) from "the mesh was unreachable"
//! (`Transport`/`Timeout`). Only `Dispatch` and `Handler` cross the wire;
//! the rest are local to the calling process.

use serde::{Deserialize, Serialize};

/// Remote fault kinds that cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    /// The request was invalid: no such handler, or access denied.
    Dispatch,
    /// The handler ran and failed.
    Handler,
}

/// Wire shape of a remote fault, distinct from ordinary payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultFrame {
    pub kind: FaultKind,
    pub message: String,
}

/// Errors surfaced by mesh operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// Local configuration error (missing domain, missing recipient).
    /// Never retried; the caller must fix its configuration.
    #[error("{0}")]
    Config(String),

    /// The requested operation does not exist or is inaccessible.
    #[error("{0}")]
    Dispatch(String),

    /// The remote handler failed while executing the operation.
    #[error("{0}")]
    Handler(String),

    /// The mesh or peer could not be reached.
    #[error("{0}")]
    Transport(String),

    /// No response arrived within the configured window.
    #[error("response timed out after {0}ms")]
    Timeout(u64),

    /// The ambient context was queried outside any scope.
    #[error("no ambient context")]
    NoContext,
}

impl Fault {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// The fault reported when no handler is registered for a method.
    pub fn no_handler(method: &str) -> Self {
        Self::Dispatch(format!("No handler for method: {method}"))
    }

    /// The fault reported when the gateway rejects a restricted name.
    pub fn inaccessible(domain: &str, method: &str) -> Self {
        Self::Dispatch(format!("Inaccessible: {domain}.{method}"))
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }

    pub fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }

    /// Reduce to the wire shape. Local-only variants that a handler returned
    /// anyway are reported to the remote caller as handler faults.
    pub fn frame(&self) -> FaultFrame {
        let (kind, message) = match self {
            Self::Dispatch(m) => (FaultKind::Dispatch, m.clone()),
            Self::Handler(m) => (FaultKind::Handler, m.clone()),
            other => (FaultKind::Handler, other.to_string()),
        };
        FaultFrame { kind, message }
    }
}

impl From<FaultFrame> for Fault {
    fn from(frame: FaultFrame) -> Self {
        match frame.kind {
            FaultKind::Dispatch => Self::Dispatch(frame.message),
            FaultKind::Handler => Self::Handler(frame.message),
        }
    }
}
