//! Trellis — domain-addressed RPC services over a shared bus, with a
//! WebSocket gateway for external clients.
//!
//! This binary runs a small demonstration mesh in one process: an in-memory
//! bus, a `greeter` service, and the gateway in front of it.
//!
//! Usage:
//!   trellis                      # gateway on ws://127.0.0.1:7070/ws
//!   trellis --port 8080          # custom port
//!   trellis --verbose            # debug logging

use clap::Parser;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trellis_gateway::{ApiService, GatewayConfig};
use trellis_service::{Context, HandlerReply, Service, ServiceConfig};
use trellis_transport::MemoryBus;

#[derive(Parser, Debug)]
#[command(name = "trellis", about = "Trellis mesh demo node")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Log connection open/close
    #[arg(long)]
    log_connections: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bus = MemoryBus::new();

    let greeter = Service::new(ServiceConfig::with_domain("greeter"), bus.clone());
    greeter.add_handler("greet", |payload: Value| async move {
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("world")
            .to_string();
        let lang = Context::current()?
            .langs()
            .and_then(|langs| langs.into_iter().next())
            .unwrap_or_else(|| "en".into());
        let greeting = match lang.split('-').next().unwrap_or("en") {
            "de" => "Hallo",
            "fr" => "Bonjour",
            "is" => "Halló",
            _ => "Hello",
        };
        Ok(HandlerReply::unary(json!(format!("{greeting}, {name}!"))))
    })?;
    greeter.add_handler("spell", |payload: Value| async move {
        let word = payload.as_str().unwrap_or_default().to_string();
        let letters: Vec<Value> = word.chars().map(|c| json!(c.to_string())).collect();
        Ok(HandlerReply::stream_iter(letters))
    })?;
    greeter.connect().await?;

    let gateway = ApiService::new(
        GatewayConfig {
            port: cli.port,
            host: cli.host.clone(),
            log_connections: cli.log_connections,
            ..GatewayConfig::default()
        },
        bus.clone(),
    )?;
    gateway.start().await?;

    let latency = greeter.test_latency().await?;
    info!(
        "mesh up, self-test latency {:.2}ms",
        latency.as_secs_f64() * 1000.0
    );
    println!("gateway: ws://{}:{}/ws", cli.host, gateway.port());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    println!("Shutting down...");
    gateway.stop().await;
    greeter.disconnect().await;
    Ok(())
}
