//! End-to-end gateway tests — external WebSocket clients against a live
//! gateway in front of a real mesh: access control, streaming, notifications,
//! and identity propagation across the edge.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use trellis_gateway::{ApiClient, ApiService, GatewayConfig};
use trellis_protocol::Fault;
use trellis_service::{Context, HandlerReply, Service, ServiceConfig};
use trellis_transport::MemoryBus;

/// Start a gateway on an OS-assigned port with fruit and veg services
/// behind it. Returns the gateway and its WebSocket URL.
async fn start_mesh(bus: &MemoryBus) -> (ApiService, String) {
    let fruit = Service::new(ServiceConfig::with_domain("fruit"), bus.clone());

    fruit
        .add_handler("getKinds", |_payload: Value| async {
            Ok(HandlerReply::unary(json!(["apple", "orange", "pear"])))
        })
        .unwrap();

    fruit
        .add_handler("getKindsStream", |_payload: Value| async {
            Ok(HandlerReply::stream_iter(vec![
                json!("apple"),
                json!("orange"),
                json!("pear"),
            ]))
        })
        .unwrap();

    fruit
        .add_handler("doErrors", |payload: Value| async move {
            match payload.as_str() {
                Some("dispatch") => Err(Fault::Dispatch("the anomaly".into())),
                Some("handler") => Err(Fault::Handler("the error".into())),
                _ => Ok(HandlerReply::unary(Value::Null)),
            }
        })
        .unwrap();

    fruit
        .add_handler("getFromContext", |payload: Value| async move {
            let context = Context::current()?;
            let key = payload.as_str().unwrap_or_default();
            Ok(HandlerReply::unary(context.get(key).unwrap_or(Value::Null)))
        })
        .unwrap();

    fruit
        .add_handler("getVeggies", |_payload: Value| async {
            let context = Context::current()?;
            context.set("bubba", json!("gump"));
            let veg = context.client("veg")?;
            let reply = veg.call("getKinds", Value::Null).await?;
            Ok(HandlerReply::unary(reply.into_value()?))
        })
        .unwrap();

    fruit
        .add_handler("login", |payload: Value| async move {
            let user = payload.as_str().unwrap_or("someone").to_string();
            Context::current()?.set_identity(user);
            Ok(HandlerReply::unary(Value::Null))
        })
        .unwrap();

    fruit
        .add_handler("_noAccess", |_payload: Value| async {
            Ok(HandlerReply::unary(json!("secret")))
        })
        .unwrap();

    let veg = Service::new(ServiceConfig::with_domain("veg"), bus.clone());
    veg.add_handler("getKinds", |_payload: Value| async {
        let context = Context::current()?;
        if context.get("bubba") != Some(json!("gump")) {
            return Err(Fault::Handler("Nope".into()));
        }
        context
            .notify(json!({"type": "bubba", "bubba": "gump"}), None)
            .await?;
        Ok(HandlerReply::unary(json!(["carrot", "celery", "broccoli"])))
    })
    .unwrap();

    fruit.connect().await.unwrap();
    veg.connect().await.unwrap();

    let gateway = ApiService::new(
        GatewayConfig {
            port: 0,
            ..GatewayConfig::default()
        },
        bus.clone(),
    )
    .unwrap();
    gateway.start().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/ws", gateway.port());
    (gateway, url)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_through_the_gateway() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    let client = ApiClient::new("fruit", &url);
    let reply = client.call("ping", Value::Null).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), json!("pong"));
}

#[tokio::test]
async fn unary_call_through_the_gateway() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    let client = ApiClient::new("fruit", &url);
    let reply = client.call("getKinds", Value::Null).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), json!(["apple", "orange", "pear"]));
}

#[tokio::test]
async fn streaming_call_through_the_gateway_preserves_order() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    let client = ApiClient::new("fruit", &url);
    let reply = client.call("getKindsStream", Value::Null).await.unwrap();
    let mut stream = reply.into_stream().unwrap();

    let mut kinds = Vec::new();
    while let Some(item) = stream.next().await {
        kinds.push(item.unwrap());
    }
    assert_eq!(kinds, vec![json!("apple"), json!("orange"), json!("pear")]);
}

#[tokio::test]
async fn fault_kinds_survive_the_edge() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;
    let client = ApiClient::new("fruit", &url);

    let dispatch = client.call("doErrors", json!("dispatch")).await.unwrap_err();
    assert_eq!(dispatch, Fault::Dispatch("the anomaly".into()));

    let handler = client.call("doErrors", json!("handler")).await.unwrap_err();
    assert_eq!(handler, Fault::Handler("the error".into()));
}

#[tokio::test]
async fn underscore_methods_are_inaccessible_externally() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    let client = ApiClient::new("fruit", &url);
    let fault = client.call("_noAccess", Value::Null).await.unwrap_err();
    assert_eq!(fault, Fault::Dispatch("Inaccessible: fruit._noAccess".into()));
}

#[tokio::test]
async fn underscore_domains_are_inaccessible_externally() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    let client = ApiClient::new("_gateway", &url);
    let fault = client.call("ping", Value::Null).await.unwrap_err();
    assert_eq!(fault, Fault::Dispatch("Inaccessible: _gateway.ping".into()));
}

#[tokio::test]
async fn underscore_methods_remain_reachable_inside_the_mesh() {
    let bus = MemoryBus::new();
    let (_gateway, _url) = start_mesh(&bus).await;

    let internal = Service::new(ServiceConfig::client_only(), bus.clone());
    let reply = internal.client("fruit").call("_noAccess", Value::Null).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), json!("secret"));
}

#[tokio::test]
async fn health_path_answers_200_with_empty_body() {
    let bus = MemoryBus::new();
    let (gateway, _url) = start_mesh(&bus).await;

    let response = reqwest::get(format!("http://127.0.0.1:{}/health", gateway.port()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "");
}

#[tokio::test]
async fn unknown_paths_answer_404() {
    let bus = MemoryBus::new();
    let (gateway, _url) = start_mesh(&bus).await;

    let response = reqwest::get(format!("http://127.0.0.1:{}/nope", gateway.port()))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn notifications_reach_only_the_originating_connection() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    let fruit_notes: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let veg_notes: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    let notes = fruit_notes.clone();
    let fruit_client = ApiClient::with_notify(
        "fruit",
        &url,
        Arc::new(move |payload| notes.lock().push(payload)),
    );
    let notes = veg_notes.clone();
    let veg_client = ApiClient::with_notify(
        "veg",
        &url,
        Arc::new(move |payload| notes.lock().push(payload)),
    );
    veg_client.connect().await.unwrap();

    // getVeggies calls into veg, whose handler notifies the ambient
    // connection (the fruit client's connection).
    let reply = fruit_client.call("getVeggies", Value::Null).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), json!(["carrot", "celery", "broccoli"]));

    assert_eq!(*fruit_notes.lock(), vec![json!({"type": "bubba", "bubba": "gump"})]);
    assert!(veg_notes.lock().is_empty());
}

#[tokio::test]
async fn identity_becomes_a_durable_connection_attribute() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;
    let client = ApiClient::new("fruit", &url);

    // Before login the connection has no identity.
    let reply = client.call("getFromContext", json!("identity")).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), Value::Null);

    client.call("login", json!("ada")).await.unwrap();

    // A later call on the same connection carries the identity set deep in
    // the previous call chain.
    let reply = client.call("getFromContext", json!("identity")).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), json!("ada"));
}

#[tokio::test]
async fn gateway_derives_langs_from_the_connection() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    // The plain WebSocket client sends no Accept-Language header, so the
    // gateway falls back to ["en"].
    let client = ApiClient::new("fruit", &url);
    let reply = client.call("getFromContext", json!("langs")).await.unwrap();
    assert_eq!(reply.into_value().unwrap(), json!(["en"]));
}

#[tokio::test]
async fn client_connection_state_is_reported_locally() {
    let bus = MemoryBus::new();
    let (_gateway, url) = start_mesh(&bus).await;

    let client = ApiClient::new("fruit", &url);
    assert!(!client.is_connected());
    client.connect().await.unwrap();
    assert!(client.is_connected());
    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn unreachable_gateway_is_a_transport_fault() {
    let client = ApiClient::new("fruit", "ws://127.0.0.1:1/ws");
    let fault = client.call("ping", Value::Null).await.unwrap_err();
    assert!(matches!(fault, Fault::Transport(_)));
}

#[tokio::test]
async fn stop_closes_the_edge() {
    let bus = MemoryBus::new();
    let (gateway, _url) = start_mesh(&bus).await;
    let port = gateway.port();

    let response = reqwest::get(format!("http://127.0.0.1:{port}/health")).await.unwrap();
    assert_eq!(response.status(), 200);

    gateway.stop().await;

    assert!(reqwest::get(format!("http://127.0.0.1:{port}/health")).await.is_err());
}
