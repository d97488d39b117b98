//! External-facing client — calls a remote gateway over WebSocket.
//!
//! The counterpart of the internal [`ServiceClient`](trellis_service::ServiceClient):
//! same invoker shape, but addressed to a gateway URL instead of the bus.
//! The connection opens lazily on the first call; a background read task
//! demultiplexes correlated replies and forwards matching notifications to a
//! caller-supplied callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use trellis_protocol::{ClientFrame, Fault, GATEWAY_DOMAIN, ServerFrame};

/// Callback invoked with the payload of each matching notification.
pub type NotifyCallback = Arc<dyn Fn(Value) + Send + Sync>;

enum ApiEvent {
    Unary(Value),
    Item(Value),
    End,
    Fault(Fault),
}

struct ClientState {
    out_tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Client for one domain exposed through a remote gateway.
pub struct ApiClient {
    domain: String,
    url: String,
    on_notify: Option<NotifyCallback>,
    response_timeout: Duration,
    state: tokio::sync::Mutex<Option<ClientState>>,
    connected: Arc<AtomicBool>,
    pending: Arc<DashMap<u64, mpsc::UnboundedSender<ApiEvent>>>,
    next_id: AtomicU64,
}

impl ApiClient {
    pub fn new(domain: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            url: url.into(),
            on_notify: None,
            response_timeout: Duration::from_secs(30),
            state: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Like [`ApiClient::new`], with a callback receiving notifications whose
    /// domain matches the target domain or the reserved gateway domain.
    pub fn with_notify(
        domain: impl Into<String>,
        url: impl Into<String>,
        on_notify: NotifyCallback,
    ) -> Self {
        Self {
            on_notify: Some(on_notify),
            ..Self::new(domain, url)
        }
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Open state of the WebSocket. Answered locally, no remote call.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open the connection now instead of lazily on the first call.
    pub async fn connect(&self) -> Result<(), Fault> {
        self.ensure_connected().await
    }

    /// Close the connection. Pending exchanges fail with a transport fault.
    pub async fn disconnect(&self) {
        let state = { self.state.lock().await.take() };
        if let Some(state) = state {
            let _ = state.out_tx.send(Message::Close(None));
            drop(state.out_tx); // writer drains the close frame, then ends
            let _ = state.writer.await;
            state.reader.abort();
        }
        self.connected.store(false, Ordering::Release);
        self.fail_pending("disconnected");
    }

    /// Invoke `method` on the target domain through the gateway.
    pub async fn call(&self, method: &str, payload: Value) -> Result<ApiReply, Fault> {
        self.ensure_connected().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(id, tx);

        let frame = ClientFrame::Request {
            id,
            domain: self.domain.clone(),
            method: method.to_string(),
            payload,
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                self.pending.remove(&id);
                return Err(Fault::transport(format!("unserializable request: {e}")));
            }
        };

        let sent = {
            let state = self.state.lock().await;
            match &*state {
                Some(state) => state.out_tx.send(Message::Text(json.into())).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.remove(&id);
            return Err(Fault::transport("connection closed"));
        }

        match tokio::time::timeout(self.response_timeout, rx.recv()).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(Fault::Timeout(self.response_timeout.as_millis() as u64))
            }
            Ok(None) => Err(Fault::transport("connection closed")),
            Ok(Some(ApiEvent::Unary(payload))) => Ok(ApiReply::Unary(payload)),
            Ok(Some(ApiEvent::Item(first))) => Ok(ApiReply::Stream(ApiReplyStream {
                first: Some(first),
                rx,
                timeout: self.response_timeout,
                done: false,
            })),
            Ok(Some(ApiEvent::End)) => Ok(ApiReply::Stream(ApiReplyStream {
                first: None,
                rx,
                timeout: self.response_timeout,
                done: true,
            })),
            Ok(Some(ApiEvent::Fault(fault))) => Err(fault),
        }
    }

    async fn ensure_connected(&self) -> Result<(), Fault> {
        let mut state = self.state.lock().await;
        if state.is_some() && self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(stale) = state.take() {
            stale.reader.abort();
            stale.writer.abort();
        }

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Fault::transport(format!("failed to connect to {}: {e}", self.url)))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending = self.pending.clone();
        let connected = self.connected.clone();
        let on_notify = self.on_notify.clone();
        let domain = self.domain.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => route_frame(&pending, &on_notify, &domain, frame),
                    Err(e) => warn!("malformed frame from gateway: {e}"),
                }
            }
            connected.store(false, Ordering::Release);
            pending.retain(|_, tx| {
                let _ = tx.send(ApiEvent::Fault(Fault::transport("connection closed")));
                false
            });
        });

        *state = Some(ClientState {
            out_tx,
            reader,
            writer,
        });
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn fail_pending(&self, reason: &str) {
        self.pending.retain(|_, tx| {
            let _ = tx.send(ApiEvent::Fault(Fault::transport(reason)));
            false
        });
    }
}

fn route_frame(
    pending: &DashMap<u64, mpsc::UnboundedSender<ApiEvent>>,
    on_notify: &Option<NotifyCallback>,
    domain: &str,
    frame: ServerFrame,
) {
    let (id, event, terminal) = match frame {
        ServerFrame::Response { id, payload, .. } => (id, ApiEvent::Unary(payload), true),
        ServerFrame::StreamItem { id, payload } => (id, ApiEvent::Item(payload), false),
        ServerFrame::StreamEnd { id } => (id, ApiEvent::End, true),
        ServerFrame::Fault { id, frame } => (id, ApiEvent::Fault(frame.into()), true),
        ServerFrame::Notification {
            domain: notify_domain,
            method,
            payload,
        } => {
            if let Some(on_notify) = on_notify {
                if method == "notify" && (notify_domain == domain || notify_domain == GATEWAY_DOMAIN)
                {
                    on_notify(payload);
                }
            }
            return;
        }
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
    if failed {
        pending.remove(&id);
    }
}

/// Result of a gateway call: a single payload or a lazy sequence.
pub enum ApiReply {
    Unary(Value),
    Stream(ApiReplyStream),
}

impl std::fmt::Debug for ApiReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(value) => f.debug_tuple("Unary").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl ApiReply {
    pub fn into_value(self) -> Result<Value, Fault> {
        match self {
            Self::Unary(value) => Ok(value),
            Self::Stream(_) => Err(Fault::transport("expected a unary reply, got a stream")),
        }
    }

    pub fn into_stream(self) -> Result<ApiReplyStream, Fault> {
        match self {
            Self::Stream(stream) => Ok(stream),
            Self::Unary(_) => Err(Fault::transport("expected a stream reply, got a value")),
        }
    }
}

/// Lazy, forward-only sequence of payloads from a streaming response.
pub struct ApiReplyStream {
    first: Option<Value>,
    rx: mpsc::UnboundedReceiver<ApiEvent>,
    timeout: Duration,
    done: bool,
}

impl ApiReplyStream {
    /// Next payload; `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<Value, Fault>> {
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
            Ok(Some(ApiEvent::Item(payload))) => Some(Ok(payload)),
            Ok(Some(ApiEvent::Unary(payload))) => {
                self.done = true;
                Some(Ok(payload))
            }
            Ok(Some(ApiEvent::End)) => {
                self.done = true;
                None
            }
            Ok(Some(ApiEvent::Fault(fault))) => {
                self.done = true;
                Some(Err(fault))
            }
        }
    }
}
