//! Pub/sub bus boundary.

use bytes::Bytes;
use tokio::sync::mpsc;
use trellis_protocol::Fault;

/// A publish/subscribe message bus addressed by subject name.
///
/// Subjects are opaque strings; the mesh uses domain names and per-instance
/// origin tokens. Messages are serialized frames; the bus never inspects
/// them.
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message to a subject.
    fn publish(
        &self,
        subject: &str,
        msg: Bytes,
    ) -> impl std::future::Future<Output = Result<(), Fault>> + Send;

    /// Subscribe to a subject, receiving messages in publish order.
    /// Dropping the returned [`Subscription`] cancels it.
    fn subscribe(
        &self,
        subject: &str,
    ) -> impl std::future::Future<Output = Result<Subscription, Fault>> + Send;
}

/// An active subject subscription.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            rx,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the bus side is gone.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Object-safe wrapper for the [`MessageBus`] trait.
pub trait BusDyn: Send + Sync {
    fn publish_dyn<'a>(
        &'a self,
        subject: &'a str,
        msg: Bytes,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Fault>> + Send + 'a>>;

    fn subscribe_dyn<'a>(
        &'a self,
        subject: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Subscription, Fault>> + Send + 'a>>;
}

impl<T: MessageBus> BusDyn for T {
    fn publish_dyn<'a>(
        &'a self,
        subject: &'a str,
        msg: Bytes,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Fault>> + Send + 'a>> {
        Box::pin(self.publish(subject, msg))
    }

    fn subscribe_dyn<'a>(
        &'a self,
        subject: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Subscription, Fault>> + Send + 'a>>
    {
        Box::pin(self.subscribe(subject))
    }
}
