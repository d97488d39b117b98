//! WebSocket gateway server using Axum.
//!
//! Binds an HTTP listener (plain or TLS-terminated) serving a WebSocket
//! upgrade path and a plain-text health-check path, then joins the mesh on
//! the reserved gateway domain. Every inbound client call is access-checked,
//! translated into a context-carrying internal call, and answered unary or
//! element-by-element for streams. The built-in `notify` handler routes
//! service-originated notifications back to live connections, best-effort.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_protocol::data::keys;
use trellis_protocol::{
    ApiNotification, ClientFrame, ContextData, Fault, GATEWAY_DOMAIN, ServerFrame, Stats,
    is_restricted,
};
use trellis_service::{Context, HandlerReply, Reply, Service, ServiceConfig};
use trellis_transport::MessageBus;

/// Payload transform hook: receives the payload plus the requested domain and
/// method, returns the replacement payload.
pub type PayloadTransform = Arc<dyn Fn(Value, &str, &str) -> Value + Send + Sync>;

/// TLS listener configuration (PEM files).
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}

/// Gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Port to listen on (0 for OS-assigned).
    pub port: u16,
    /// Hostname to bind to.
    pub host: String,
    /// WebSocket upgrade path.
    pub path: String,
    /// Health-check path; answers 200 with an empty body.
    pub health_path: String,
    /// Serve TLS instead of plain TCP.
    pub tls: Option<TlsConfig>,
    /// Log connection open/close.
    pub log_connections: bool,
    /// Response timeout for mesh calls made on behalf of clients.
    pub response_timeout: Option<Duration>,
    /// Inbound payload transform; defaults to identity.
    pub transform_request: Option<PayloadTransform>,
    /// Outbound payload transform; defaults to identity.
    pub transform_response: Option<PayloadTransform>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            host: "127.0.0.1".into(),
            path: "/ws".into(),
            health_path: "/health".into(),
            tls: None,
            log_connections: false,
            response_timeout: None,
            transform_request: None,
            transform_response: None,
        }
    }
}

/// Per-connection attributes, mutated only by the connection's own task.
#[derive(Debug, Clone)]
pub struct ConnectionAttributes {
    pub identity: Option<String>,
    pub langs: Vec<String>,
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<ServerFrame>,
    attributes: Arc<RwLock<ConnectionAttributes>>,
}

struct GatewayState {
    service: Service,
    connections: Arc<DashMap<String, ConnectionHandle>>,
    config: GatewayConfig,
    shutdown: broadcast::Sender<()>,
}

enum ListenerHandle {
    Plain {
        shutdown_tx: mpsc::Sender<()>,
        task: JoinHandle<()>,
    },
    Tls {
        handle: axum_server::Handle,
        task: JoinHandle<()>,
    },
}

/// The gateway: a mesh [`Service`] on the reserved gateway domain plus the
/// HTTP/WebSocket edge in front of it.
pub struct ApiService {
    state: Arc<GatewayState>,
    listener: parking_lot::Mutex<Option<ListenerHandle>>,
    port: AtomicU16,
}

impl ApiService {
    pub fn new(config: GatewayConfig, bus: impl MessageBus) -> Result<Self, Fault> {
        let service = Service::new(
            ServiceConfig {
                domain: Some(GATEWAY_DOMAIN.into()),
                response_timeout: config.response_timeout,
            },
            bus,
        );

        let connections: Arc<DashMap<String, ConnectionHandle>> = Arc::new(DashMap::new());
        let recipients = connections.clone();
        service.add_handler("notify", move |payload: Value| {
            let recipients = recipients.clone();
            async move {
                let notification: ApiNotification = serde_json::from_value(payload)
                    .map_err(|e| Fault::Handler(format!("malformed notification: {e}")))?;
                match recipients.get(&notification.recipient.id) {
                    Some(connection) => {
                        let frame = ServerFrame::Notification {
                            domain: notification
                                .domain
                                .unwrap_or_else(|| GATEWAY_DOMAIN.to_string()),
                            method: "notify".into(),
                            payload: notification.payload,
                        };
                        // Best-effort: a connection that closed in the
                        // meantime drops the notification.
                        let _ = connection.tx.send(frame);
                    }
                    None => {
                        debug!(
                            "notification recipient {} gone, dropped",
                            notification.recipient.id
                        );
                    }
                }
                Ok(HandlerReply::unary(Value::Null))
            }
        })?;

        let (shutdown, _) = broadcast::channel(8);
        Ok(Self {
            state: Arc::new(GatewayState {
                service,
                connections,
                config,
                shutdown,
            }),
            listener: parking_lot::Mutex::new(None),
            port: AtomicU16::new(0),
        })
    }

    /// The mesh service backing this gateway.
    pub fn service(&self) -> &Service {
        &self.state.service
    }

    /// Actual bound port (useful with port 0).
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Bind the HTTP listener, then connect to the mesh. The listener is
    /// fully bound before this returns.
    pub async fn start(&self) -> Result<(), Fault> {
        let config = &self.state.config;
        let app = Router::new()
            .route(&config.path, get(ws_upgrade_handler))
            .route(&config.health_path, get(health_handler))
            .fallback(fallback_handler)
            .with_state(self.state.clone());

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| Fault::config(format!("invalid listen address: {e}")))?;

        let (listener, actual_port) = match &config.tls {
            Some(tls) => {
                let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    &tls.cert_path,
                    &tls.key_path,
                )
                .await
                .map_err(|e| Fault::config(format!("failed to load TLS material: {e}")))?;

                let handle = axum_server::Handle::new();
                let server = axum_server::bind_rustls(addr, rustls)
                    .handle(handle.clone())
                    .serve(app.into_make_service());
                let task = tokio::spawn(async move {
                    if let Err(e) = server.await {
                        warn!("gateway TLS listener error: {e}");
                    }
                });
                let bound = handle
                    .listening()
                    .await
                    .ok_or_else(|| Fault::transport("TLS listener failed to bind"))?;
                (ListenerHandle::Tls { handle, task }, bound.port())
            }
            None => {
                let tcp = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| Fault::transport(format!("failed to bind {addr}: {e}")))?;
                let bound = tcp
                    .local_addr()
                    .map_err(|e| Fault::transport(format!("no local address: {e}")))?;

                let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
                let task = tokio::spawn(async move {
                    axum::serve(tcp, app)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.recv().await;
                        })
                        .await
                        .ok();
                });
                (ListenerHandle::Plain { shutdown_tx, task }, bound.port())
            }
        };

        self.port.store(actual_port, Ordering::Release);
        *self.listener.lock() = Some(listener);
        info!(
            "gateway listening on {}://{}:{}{}",
            if config.tls.is_some() { "wss" } else { "ws" },
            config.host,
            actual_port,
            config.path
        );

        self.state.service.connect().await
    }

    /// Close the WebSocket layer, shut the HTTP listener down, then
    /// disconnect from the mesh, in reverse order of [`ApiService::start`].
    pub async fn stop(&self) {
        let _ = self.state.shutdown.send(());

        let listener = { self.listener.lock().take() };
        match listener {
            Some(ListenerHandle::Plain { shutdown_tx, task }) => {
                let _ = shutdown_tx.send(()).await;
                let _ = task.await;
            }
            Some(ListenerHandle::Tls { handle, task }) => {
                handle.graceful_shutdown(Some(Duration::from_secs(5)));
                let _ = task.await;
            }
            None => {}
        }

        self.state.service.disconnect().await;
        info!("gateway stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let langs = parse_langs(&headers);
    ws.on_upgrade(move |socket| handle_connection(socket, state, langs))
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn parse_langs(headers: &HeaderMap) -> Vec<String> {
    let langs: Vec<String> = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .map(|lang| lang.split(';').next().unwrap_or(lang).trim().to_string())
                .filter(|lang| !lang.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if langs.is_empty() {
        vec!["en".into()]
    } else {
        langs
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket connection handling
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, langs: Vec<String>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    if state.config.log_connections {
        info!("Connected: {connection_id}");
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let attributes = Arc::new(RwLock::new(ConnectionAttributes {
        identity: None,
        langs,
    }));
    state.connections.insert(
        connection_id.clone(),
        ConnectionHandle {
            tx: out_tx.clone(),
            attributes: attributes.clone(),
        },
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut shutdown_rx = state.shutdown.subscribe();

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Ok(json) = serde_json::to_string(&frame) {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Request { id, domain, method, payload }) => {
                                tokio::spawn(handle_call(
                                    state.clone(),
                                    connection_id.clone(),
                                    out_tx.clone(),
                                    attributes.clone(),
                                    id,
                                    domain,
                                    method,
                                    payload,
                                ));
                            }
                            Err(e) => {
                                let _ = out_tx.send(ServerFrame::fault(
                                    0,
                                    &Fault::Dispatch(format!("malformed request: {e}")),
                                ));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {connection_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.connections.remove(&connection_id);
    if state.config.log_connections {
        info!("Disconnected: {connection_id}");
    }
}

/// Translate one client call into a context-carrying mesh call and stream
/// the results back. Runs as its own task so a slow stream does not block
/// the connection's other requests.
#[allow(clippy::too_many_arguments)]
async fn handle_call(
    state: Arc<GatewayState>,
    connection_id: String,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
    attributes: Arc<RwLock<ConnectionAttributes>>,
    id: u64,
    domain: String,
    method: String,
    payload: Value,
) {
    let start = Instant::now();

    // The sole enforcement point separating the external surface from the
    // full internal mesh surface.
    if is_restricted(&domain) || is_restricted(&method) {
        let _ = out_tx.send(ServerFrame::fault(id, &Fault::inaccessible(&domain, &method)));
        return;
    }

    let payload = match &state.config.transform_request {
        Some(transform) => transform(payload, &domain, &method),
        None => payload,
    };

    let (identity, langs) = {
        let attrs = attributes.read();
        (attrs.identity.clone(), attrs.langs.clone())
    };

    let mut context_data = ContextData::new();
    context_data.insert(keys::ORIGIN_DOMAIN.into(), Value::String(domain.clone()));
    if let Some(identity) = identity {
        context_data.insert(keys::IDENTITY.into(), Value::String(identity));
    }
    context_data.insert(
        keys::LANGS.into(),
        Value::Array(langs.into_iter().map(Value::String).collect()),
    );
    context_data.insert(
        keys::CONNECTION_ID.into(),
        Value::String(connection_id.clone()),
    );

    let client = state.service.client(&domain);
    let transform_response = state.config.transform_response.clone();

    Context::scope(context_data, async move {
        match client.call(&method, payload).await {
            Ok(Reply::Unary(value)) => {
                refresh_identity(&attributes);
                let value = apply_transform(&transform_response, value, &domain, &method);
                let _ = out_tx.send(ServerFrame::Response {
                    id,
                    payload: value,
                    stats: Stats {
                        time: start.elapsed().as_secs_f64() * 1000.0,
                    },
                });
            }
            Ok(Reply::Stream(mut stream)) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            // Capture identity changes incrementally, not
                            // only at stream end.
                            refresh_identity(&attributes);
                            let value =
                                apply_transform(&transform_response, value, &domain, &method);
                            if out_tx.send(ServerFrame::StreamItem { id, payload: value }).is_err()
                            {
                                return;
                            }
                        }
                        Err(fault) => {
                            let _ = out_tx.send(ServerFrame::fault(id, &fault));
                            return;
                        }
                    }
                }
                let _ = out_tx.send(ServerFrame::StreamEnd { id });
            }
            Err(fault) => {
                let _ = out_tx.send(ServerFrame::fault(id, &fault));
            }
        }
    })
    .await;
}

fn refresh_identity(attributes: &Arc<RwLock<ConnectionAttributes>>) {
    if let Ok(context) = Context::current() {
        attributes.write().identity = context.identity();
    }
}

fn apply_transform(
    transform: &Option<PayloadTransform>,
    payload: Value,
    domain: &str,
    method: &str,
) -> Value {
    match transform {
        Some(transform) => transform(payload, domain, method),
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_LANGUAGE, value.parse().unwrap());
        headers
    }

    #[test]
    fn langs_parsed_from_accept_language() {
        let langs = parse_langs(&headers_with("en-US,en;q=0.9,is;q=0.8"));
        assert_eq!(langs, vec!["en-US", "en", "is"]);
    }

    #[test]
    fn langs_default_to_english() {
        assert_eq!(parse_langs(&HeaderMap::new()), vec!["en"]);
    }

    #[test]
    fn langs_ignore_empty_entries() {
        let langs = parse_langs(&headers_with(",,fr"));
        assert_eq!(langs, vec!["fr"]);
    }
}
