//! In-process bus — the broker used by tests and single-process meshes.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use trellis_protocol::Fault;

use crate::bus::{MessageBus, Subscription};

/// An in-memory pub/sub broker. Cloning yields another handle to the same
/// broker, so every participant in a process can share one instance.
///
/// Delivery is load-balanced: a message published to a subject goes to one
/// subscriber of that subject, round-robin, so replicated services sharing a
/// domain behave like a queue group. Messages published to a subject with no
/// subscribers are dropped.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<DashMap<String, Topic>>,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<mpsc::UnboundedSender<Bytes>>,
    next: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, msg: Bytes) -> Result<(), Fault> {
        let Some(mut topic) = self.topics.get_mut(subject) else {
            debug!("no subscribers for subject {subject}, message dropped");
            return Ok(());
        };

        topic.subscribers.retain(|tx| !tx.is_closed());
        let count = topic.subscribers.len();
        if count == 0 {
            debug!("no live subscribers for subject {subject}, message dropped");
            return Ok(());
        }

        // Round-robin among same-subject subscribers.
        let start = topic.next;
        for offset in 0..count {
            let index = (start + offset) % count;
            if topic.subscribers[index].send(msg.clone()).is_ok() {
                topic.next = (index + 1) % count;
                return Ok(());
            }
        }
        debug!("all subscribers of subject {subject} gone, message dropped");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, Fault> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(subject.to_string()).or_default().subscribers.push(tx);
        Ok(Subscription::new(subject, rx))
    }
}
