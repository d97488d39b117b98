//! Handler traits and reply shapes.

use futures_util::Stream;
use futures_util::stream::BoxStream;
use serde_json::Value;
use trellis_protocol::Fault;

/// What a handler produces: one value, or a finite, forward-only,
/// non-restartable sequence of values forwarded to the caller element by
/// element.
pub enum HandlerReply {
    Unary(Value),
    Stream(BoxStream<'static, Value>),
}

impl HandlerReply {
    pub fn unary(value: Value) -> Self {
        Self::Unary(value)
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// Stream over an eagerly known sequence.
    pub fn stream_iter<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::Stream(Box::pin(futures_util::stream::iter(values)))
    }
}

pub type HandlerResult = Result<HandlerReply, Fault>;

/// A named operation on a service. Handlers read and mutate the ambient
/// [`Context`](crate::Context) and may call other domains through
/// `Context::current()?.client(..)`.
pub trait Handler: Send + Sync + 'static {
    fn call(
        &self,
        payload: Value,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: Value) -> impl std::future::Future<Output = HandlerResult> + Send {
        (self)(payload)
    }
}

/// Object-safe wrapper for [`Handler`].
pub(crate) trait HandlerDyn: Send + Sync {
    fn call_dyn(
        &self,
        payload: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + '_>>;
}

impl<T: Handler> HandlerDyn for T {
    fn call_dyn(
        &self,
        payload: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + '_>> {
        Box::pin(self.call(payload))
    }
}
