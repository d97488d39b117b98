//! Client invoker for a remote domain.
//!
//! Replaces the dynamic per-property proxy of reflective runtimes with an
//! explicit invoker keyed by method name: `call(method, payload)` plus plain
//! `connect`/`disconnect`/`is_connected` methods.

use serde_json::Value;
use trellis_protocol::{ContextData, Fault};
use trellis_transport::{FrameStream, TransportReply};

use crate::context::Context;
use crate::service::Service;

/// Invoker for one domain, backed by a [`Service`] instance (which may be
/// client-only). Carries the ambient context with every call and merges the
/// reply's shared data back into it.
#[derive(Clone)]
pub struct ServiceClient {
    service: Service,
    domain: String,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl ServiceClient {
    pub(crate) fn new(service: Service, domain: &str) -> Self {
        Self {
            service,
            domain: domain.to_string(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Connection state of the backing service. Answered locally.
    pub fn is_connected(&self) -> bool {
        self.service.is_connected()
    }

    pub async fn connect(&self) -> Result<(), Fault> {
        self.service.connect().await
    }

    pub async fn disconnect(&self) {
        self.service.disconnect().await;
    }

    /// Invoke `method` on the target domain. Connects lazily. The ambient
    /// context's data rides along when a context is present; the reply's
    /// shared data is merged back into it on arrival.
    pub async fn call(&self, method: &str, payload: Value) -> Result<Reply, Fault> {
        let context = Context::ambient();
        let context_data = context
            .as_ref()
            .map(Context::data)
            .unwrap_or_else(ContextData::new);

        let reply = self
            .service
            .request(&self.domain, method, payload, context_data)
            .await?;

        match reply {
            TransportReply::Unary(response) => {
                if let Some(context) = &context {
                    context.merge_shared(response.shared_context_data);
                }
                Ok(Reply::Unary(response.payload))
            }
            TransportReply::Stream(frames) => Ok(Reply::Stream(ReplyStream { frames })),
        }
    }
}

/// Result of a call: a single payload or a lazy sequence of payloads.
pub enum Reply {
    Unary(Value),
    Stream(ReplyStream),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(value) => f.debug_tuple("Unary").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Reply {
    /// The unary payload, or a fault if the reply was a stream.
    pub fn into_value(self) -> Result<Value, Fault> {
        match self {
            Self::Unary(value) => Ok(value),
            Self::Stream(_) => Err(Fault::transport("expected a unary reply, got a stream")),
        }
    }

    /// The reply stream, or a fault if the reply was unary.
    pub fn into_stream(self) -> Result<ReplyStream, Fault> {
        match self {
            Self::Stream(stream) => Ok(stream),
            Self::Unary(_) => Err(Fault::transport("expected a stream reply, got a value")),
        }
    }
}

/// Lazy, forward-only sequence of reply payloads. Each element's shared
/// context data is merged into the ambient context before the payload is
/// yielded, so identity changes made downstream become visible to the
/// consuming chain element by element.
pub struct ReplyStream {
    frames: FrameStream,
}

impl ReplyStream {
    /// Next payload; `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<Value, Fault>> {
        match self.frames.next().await? {
            Ok(frame) => {
                if let Some(context) = Context::ambient() {
                    context.merge_shared(frame.shared_context_data);
                }
                Some(Ok(frame.payload))
            }
            Err(fault) => Some(Err(fault)),
        }
    }
}
