//! Correlated request/response exchange over the bus.
//!
//! A connection subscribes a set of subjects (the service's domain, if any,
//! plus its unique origin token), runs one receive loop per subject, and
//! routes frames: inbound requests go to the attached [`RequestHandler`],
//! reply frames are matched to pending requests by correlation id.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use trellis_protocol::{Envelope, Fault, MeshRequest, MeshResponse};

use crate::bus::BusDyn;

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allotted for a response (and for each stream element) before the
    /// exchange fails with a timeout fault.
    pub response_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Trait implemented by the service layer to answer requests arriving on the
/// connection's subjects.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle_request(
        &self,
        request: MeshRequest,
    ) -> impl std::future::Future<Output = Result<ServerReply, Fault>> + Send;
}

/// Object-safe wrapper for [`RequestHandler`].
pub trait RequestHandlerDyn: Send + Sync {
    fn handle_request_dyn(
        &self,
        request: MeshRequest,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<ServerReply, Fault>> + Send + '_>,
    >;
}

impl<T: RequestHandler> RequestHandlerDyn for T {
    fn handle_request_dyn(
        &self,
        request: MeshRequest,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<ServerReply, Fault>> + Send + '_>,
    > {
        Box::pin(self.handle_request(request))
    }
}

/// Body of a served request, before framing.
pub enum ServerReply {
    /// A single response frame.
    Unary(MeshResponse),
    /// A finite run of response frames; channel close ends the stream.
    Stream(mpsc::Receiver<MeshResponse>),
}

/// Correlated reply delivered to the requesting side.
pub enum TransportReply {
    Unary(MeshResponse),
    Stream(FrameStream),
}

enum ReplyEvent {
    Unary(MeshResponse),
    Item(MeshResponse),
    End,
    Fault(Fault),
}

/// A correlated request/response connection over a bus.
pub struct MessageConnection {
    bus: Arc<dyn BusDyn>,
    pending: Arc<DashMap<u64, mpsc::UnboundedSender<ReplyEvent>>>,
    next_id: AtomicU64,
    response_timeout: Duration,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl MessageConnection {
    /// Subscribe the given subjects and start the receive loops. Requests
    /// arriving on any subject are dispatched through `handler`; a connection
    /// without a handler is client-only and ignores inbound requests.
    pub async fn connect(
        bus: Arc<dyn BusDyn>,
        subjects: Vec<String>,
        handler: Option<Arc<dyn RequestHandlerDyn>>,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>, Fault> {
        let conn = Arc::new(Self {
            bus: bus.clone(),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            response_timeout: config.response_timeout,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let mut subscription = bus.subscribe_dyn(&subject).await?;
            let bus = bus.clone();
            let handler = handler.clone();
            let pending = conn.pending.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(raw) = subscription.next().await {
                    let envelope: Envelope = match serde_json::from_slice(&raw) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!("malformed frame on subject {subject}: {e}");
                            continue;
                        }
                    };
                    match envelope {
                        Envelope::Request(request) => match &handler {
                            Some(handler) => {
                                let bus = bus.clone();
                                let handler = handler.clone();
                                tokio::spawn(serve_request(bus, handler, request));
                            }
                            None => {
                                debug!(
                                    "request for {} on client-only connection ignored",
                                    request.method
                                );
                            }
                        },
                        reply => route_reply(&pending, reply),
                    }
                }
            }));
        }
        *conn.tasks.lock() = tasks;

        Ok(conn)
    }

    /// Send a correlated request to `subject` and await its reply. The
    /// request's `id` field is assigned here.
    pub async fn request(
        &self,
        subject: &str,
        mut request: MeshRequest,
    ) -> Result<TransportReply, Fault> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(id, tx);

        let raw = encode(&Envelope::Request(request));
        if let Err(fault) = self.bus.publish_dyn(subject, raw).await {
            self.pending.remove(&id);
            return Err(fault);
        }

        match tokio::time::timeout(self.response_timeout, rx.recv()).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(Fault::Timeout(self.response_timeout.as_millis() as u64))
            }
            Ok(None) => Err(Fault::transport("connection closed")),
            Ok(Some(ReplyEvent::Unary(response))) => Ok(TransportReply::Unary(response)),
            Ok(Some(ReplyEvent::Item(first))) => Ok(TransportReply::Stream(FrameStream {
                first: Some(first),
                rx,
                timeout: self.response_timeout,
                done: false,
            })),
            Ok(Some(ReplyEvent::End)) => Ok(TransportReply::Stream(FrameStream {
                first: None,
                rx,
                timeout: self.response_timeout,
                done: true,
            })),
            Ok(Some(ReplyEvent::Fault(fault))) => Err(fault),
        }
    }

    /// Stop the receive loops and fail any pending exchanges.
    pub async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending.clear();
    }
}

/// Lazy, ordered stream of reply frames for one exchange.
pub struct FrameStream {
    first: Option<MeshResponse>,
    rx: mpsc::UnboundedReceiver<ReplyEvent>,
    timeout: Duration,
    done: bool,
}

impl FrameStream {
    /// Next frame. `None` after the explicit end-of-stream frame.
    pub async fn next(&mut self) -> Option<Result<MeshResponse, Fault>> {
        if let Some(first) = self.first.take() {
            return Some(Ok(first));
        }
        if self.done {
            return None;
        }
        match tokio::time::timeout(self.timeout, self.rx.recv()).await {
            Err(_) => {
                self.done = true;
                Some(Err(Fault::Timeout(self.timeout.as_millis() as u64)))
            }
            Ok(None) => {
                self.done = true;
                Some(Err(Fault::transport("connection closed mid-stream")))
            }
            Ok(Some(ReplyEvent::Item(frame))) => Some(Ok(frame)),
            Ok(Some(ReplyEvent::Unary(frame))) => {
                self.done = true;
                Some(Ok(frame))
            }
            Ok(Some(ReplyEvent::End)) => {
                self.done = true;
                None
            }
            Ok(Some(ReplyEvent::Fault(fault))) => {
                self.done = true;
                Some(Err(fault))
            }
        }
    }
}

fn encode(envelope: &Envelope) -> Bytes {
    // Envelope serialization cannot fail: all payloads are already JSON values.
    Bytes::from(serde_json::to_vec(envelope).unwrap_or_default())
}

fn route_reply(pending: &DashMap<u64, mpsc::UnboundedSender<ReplyEvent>>, envelope: Envelope) {
    let id = envelope.id();
    let (event, terminal) = match envelope {
        Envelope::Response(r) => (ReplyEvent::Unary(r), true),
        Envelope::StreamItem(r) => (ReplyEvent::Item(r), false),
        Envelope::StreamEnd { .. } => (ReplyEvent::End, true),
        Envelope::Fault { frame, .. } => (ReplyEvent::Fault(frame.into()), true),
        Envelope::Request(_) => return,
    };

    if terminal {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(event);
        } else {
            debug!("reply for unknown exchange {id} dropped");
        }
        return;
    }

    let failed = match pending.get(&id) {
        Some(tx) => tx.send(event).is_err(),
        None => {
            debug!("stream frame for unknown exchange {id} dropped");
            return;
        }
    };
    // Requester dropped its stream; forget the exchange.
    if failed {
        pending.remove(&id);
    }
}

async fn serve_request(
    bus: Arc<dyn BusDyn>,
    handler: Arc<dyn RequestHandlerDyn>,
    request: MeshRequest,
) {
    let id = request.id;
    let origin = request.origin.clone();

    match handler.handle_request_dyn(request).await {
        Ok(ServerReply::Unary(response)) => {
            publish_reply(&bus, &origin, &Envelope::Response(response)).await;
        }
        Ok(ServerReply::Stream(mut frames)) => {
            while let Some(frame) = frames.recv().await {
                publish_reply(&bus, &origin, &Envelope::StreamItem(frame)).await;
            }
            publish_reply(
                &bus,
                &origin,
                &Envelope::StreamEnd {
                    id,
                    origin: origin.clone(),
                },
            )
            .await;
        }
        Err(fault) => {
            publish_reply(&bus, &origin, &Envelope::fault(id, origin.clone(), &fault)).await;
        }
    }
}

async fn publish_reply(bus: &Arc<dyn BusDyn>, origin: &str, envelope: &Envelope) {
    if let Err(fault) = bus.publish_dyn(origin, encode(envelope)).await {
        error!("failed to publish reply to {origin}: {fault}");
    }
}
