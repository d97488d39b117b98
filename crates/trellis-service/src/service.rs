//! A mesh participant: handler registry, request dispatcher, client factory.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use trellis_protocol::data::keys;
use trellis_protocol::{Fault, MeshRequest, MeshResponse, Stats};
use trellis_transport::{
    ConnectionConfig, MessageBus, MessageConnection, RequestHandler, RequestHandlerDyn,
    ServerReply, TransportReply,
};

use crate::client::ServiceClient;
use crate::context::{Context, ContextCell};
use crate::handler::{Handler, HandlerDyn, HandlerReply};

/// Service configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Logical address of this service on the mesh. A service with no
    /// domain is a client only: it cannot receive requests or register
    /// handlers.
    pub domain: Option<String>,
    /// Time allotted for a response before a timeout fault.
    pub response_timeout: Option<Duration>,
}

impl ServiceConfig {
    pub fn with_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::default()
        }
    }

    /// A client-only configuration: no domain, no handlers.
    pub fn client_only() -> Self {
        Self::default()
    }
}

type HandlerMap = HashMap<String, Arc<dyn HandlerDyn>>;

/// Built into every service, registered or not.
async fn ping(_payload: Value) -> crate::handler::HandlerResult {
    Ok(HandlerReply::unary(Value::String("pong".into())))
}

struct ServiceInner {
    domain: Option<String>,
    /// Unique token addressing replies to exactly this instance, regardless
    /// of how many instances share the domain.
    origin: String,
    response_timeout: Duration,
    bus: Arc<dyn trellis_transport::BusDyn>,
    /// Immutable map, swapped wholesale by `add_handler`.
    handlers: parking_lot::RwLock<Arc<HandlerMap>>,
    state: tokio::sync::Mutex<Option<Arc<MessageConnection>>>,
    connected: AtomicBool,
}

/// One participant in the mesh. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub fn new(config: ServiceConfig, bus: impl MessageBus) -> Self {
        let mut handlers: HandlerMap = HashMap::new();
        handlers.insert("ping".into(), Arc::new(ping));

        Self {
            inner: Arc::new(ServiceInner {
                domain: config.domain,
                origin: uuid::Uuid::new_v4().simple().to_string(),
                response_timeout: config
                    .response_timeout
                    .unwrap_or(ConnectionConfig::default().response_timeout),
                bus: Arc::new(bus),
                handlers: parking_lot::RwLock::new(Arc::new(handlers)),
                state: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// The configured domain, if any.
    pub fn domain(&self) -> Option<&str> {
        self.inner.domain.as_deref()
    }

    /// The per-instance reply address.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Connection state. Answered locally, never via a remote call.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Register a handler. Fails on a client-only service. The registry is
    /// rebuilt, not mutated in place, so dispatches in flight keep the map
    /// they resolved against.
    pub fn add_handler(&self, method: impl Into<String>, handler: impl Handler) -> Result<(), Fault> {
        if self.inner.domain.is_none() {
            return Err(Fault::config(
                "cannot register a handler on a service with no domain",
            ));
        }
        let mut registry = self.inner.handlers.write();
        let mut next: HandlerMap = (**registry).clone();
        next.insert(method.into(), Arc::new(handler));
        *registry = Arc::new(next);
        Ok(())
    }

    /// Subscribe this instance's subjects on the bus and start serving.
    /// Connecting twice is a no-op.
    pub async fn connect(&self) -> Result<(), Fault> {
        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let mut subjects = Vec::with_capacity(2);
        if let Some(domain) = &self.inner.domain {
            subjects.push(domain.clone());
        }
        subjects.push(self.inner.origin.clone());

        // Only a domain-bearing instance answers requests.
        let handler: Option<Arc<dyn RequestHandlerDyn>> = self
            .inner
            .domain
            .is_some()
            .then(|| Arc::new(self.clone()) as Arc<dyn RequestHandlerDyn>);

        let connection = MessageConnection::connect(
            self.inner.bus.clone(),
            subjects,
            handler,
            ConnectionConfig {
                response_timeout: self.inner.response_timeout,
            },
        )
        .await?;

        *state = Some(connection);
        self.inner.connected.store(true, Ordering::Release);
        info!(
            "service {} connected (origin {})",
            self.domain_label(),
            self.inner.origin
        );
        Ok(())
    }

    /// Tear down the transport subscriptions. Disconnecting while not
    /// connected is a no-op.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(connection) = state.take() {
            connection.close().await;
            self.inner.connected.store(false, Ordering::Release);
            info!("service {} disconnected", self.domain_label());
        }
    }

    /// Client invoker for a domain on this mesh.
    pub fn client(&self, domain: &str) -> ServiceClient {
        ServiceClient::new(self.clone(), domain)
    }

    /// Round-trip time of a `ping` through the full request/response path,
    /// from this instance to its own domain and back. The trip entails four
    /// transfers: request to the bus, bus to a serving instance, response to
    /// the bus, bus back here.
    pub async fn test_latency(&self) -> Result<Duration, Fault> {
        let domain = self
            .inner
            .domain
            .clone()
            .ok_or_else(|| Fault::config("test_latency requires a configured domain"))?;

        let client = self.client(&domain);
        let start = Instant::now();
        let reply = client.call("ping", Value::Null).await?;
        match reply {
            crate::client::Reply::Unary(value) if value == "pong" => Ok(start.elapsed()),
            _ => Err(Fault::transport("ping/pong failed")),
        }
    }

    /// Send a correlated request to a domain. Connects lazily.
    pub(crate) async fn request(
        &self,
        domain: &str,
        method: &str,
        payload: Value,
        context_data: trellis_protocol::ContextData,
    ) -> Result<TransportReply, Fault> {
        self.connect().await?;
        let connection = {
            let state = self.inner.state.lock().await;
            state
                .clone()
                .ok_or_else(|| Fault::transport("not connected"))?
        };
        connection
            .request(
                domain,
                MeshRequest {
                    id: 0, // assigned by the connection
                    domain: domain.to_string(),
                    origin: self.inner.origin.clone(),
                    method: method.to_string(),
                    payload,
                    context_data,
                },
            )
            .await
    }

    fn domain_label(&self) -> &str {
        self.inner.domain.as_deref().unwrap_or("client")
    }
}

impl RequestHandler for Service {
    async fn handle_request(&self, request: MeshRequest) -> Result<ServerReply, Fault> {
        let start = Instant::now();
        let MeshRequest {
            id,
            origin,
            method,
            payload,
            mut context_data,
            ..
        } = request;

        let handler = self
            .inner
            .handlers
            .read()
            .get(&method)
            .cloned()
            .ok_or_else(|| Fault::no_handler(&method))?;

        // Stamp the chain's origin domain the first time it touches a
        // domain-bearing service; it then flows unchanged through nested
        // calls.
        if !context_data.contains_key(keys::DOMAIN) {
            if let Some(domain) = &self.inner.domain {
                context_data.insert(keys::DOMAIN.into(), Value::String(domain.clone()));
            }
        }

        let cell = Arc::new(ContextCell::new(context_data));
        cell.bind_client(self.clone());

        let outcome =
            Context::scope_cell(cell.clone(), handler.call_dyn(payload)).await;

        match outcome {
            Ok(HandlerReply::Unary(value)) => Ok(ServerReply::Unary(MeshResponse {
                id,
                origin,
                payload: value,
                stats: Stats {
                    time: start.elapsed().as_secs_f64() * 1000.0,
                },
                shared_context_data: cell.shared_data(),
            })),
            Ok(HandlerReply::Stream(stream)) => {
                let (tx, rx) = mpsc::channel(16);
                let frame_cell = cell.clone();
                tokio::spawn(Context::scope_cell(cell, async move {
                    let mut stream = stream;
                    while let Some(value) = stream.next().await {
                        let frame = MeshResponse {
                            id,
                            origin: origin.clone(),
                            payload: value,
                            stats: Stats {
                                time: start.elapsed().as_secs_f64() * 1000.0,
                            },
                            shared_context_data: frame_cell.shared_data(),
                        };
                        if tx.send(frame).await.is_err() {
                            debug!("stream consumer gone, dropping remaining elements");
                            break;
                        }
                    }
                }));
                Ok(ServerReply::Stream(rx))
            }
            Err(fault) => {
                error!("Error handling request [{method}]: {fault}");
                Err(fault)
            }
        }
    }
}
