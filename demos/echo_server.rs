//! Echo Server - replies to every message with the same payload.
//!
//! This example demonstrates:
//! - Building a server with the ISO 8583 framing preset
//! - Replying through the `message_received` return value
//! - Reacting to connection lifecycle events
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=layer4_stack=debug cargo run --example echo_server -- 8583
//! ```

use bytes::Bytes;
use layer4_stack::{ConnectionInfo, FramingConfig, Message, Server, ServerConfig, ServerEventHandler};
use tracing_subscriber::EnvFilter;

struct Echo;

impl ServerEventHandler for Echo {
    fn client_connected(&self, client: &ConnectionInfo) {
        tracing::info!(id = %client.id, peer = %client.peer(), "hello");
    }

    fn client_disconnected(&self, client: &ConnectionInfo) {
        tracing::info!(id = %client.id, "bye");
    }

    fn message_received(&self, message: &Message) -> Option<Bytes> {
        tracing::info!(
            connection = %message.connection_id,
            payload = %String::from_utf8_lossy(message.payload()),
            "echo"
        );
        Some(message.payload.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(8583);

    let server = Server::builder()
        .config(ServerConfig::new("0.0.0.0", port))
        .framing(FramingConfig::iso8583()?)
        .handler(Echo)
        .build()?;

    let addr = server.start().await?;
    println!("echo server listening on {addr}, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
