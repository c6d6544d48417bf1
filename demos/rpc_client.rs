//! RPC Client - request/response over the HSM framing preset.
//!
//! This example demonstrates:
//! - Loading a client configuration from JSON
//! - Correlating replies by the 4-byte id prefix of each payload
//! - Running several RPCs concurrently on one connection
//!
//! A local responder is started in-process, so the example is self-contained.
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=layer4_stack=debug cargo run --example rpc_client
//! ```

use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use layer4_stack::{Client, ClientConfig, FramingConfig, Message, Server, ServerEventHandler};
use tracing_subscriber::EnvFilter;

/// Answers `<id>NC` with `<id>ND` followed by a fake firmware version.
struct Responder;

impl ServerEventHandler for Responder {
    fn message_received(&self, message: &Message) -> Option<Bytes> {
        let id = message.payload().get(..4)?;
        let mut reply = id.to_vec();
        reply.extend_from_slice(b"ND00fw-1.0");
        Some(Bytes::from(reply))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Server::builder()
        .framing(FramingConfig::hsm()?)
        .handler(Responder)
        .build()?;
    let addr = server.start().await?;

    let config = ClientConfig::from_json(&format!(
        r#"{{"address": "127.0.0.1", "port": {}, "send_timeout_ms": 1000}}"#,
        addr.port()
    ))?;
    let client = Client::builder()
        .config(config)
        .framing(FramingConfig::hsm()?)
        .build()?;
    client.connect().await?;

    let requests = (0..5).map(|i| {
        let client = &client;
        async move {
            let request = Bytes::from(format!("{i:04}NC"));
            (i, client.rpc(request, Duration::from_secs(2)).await)
        }
    });

    for (i, reply) in join_all(requests).await {
        match reply? {
            Some(reply) => println!("request {i:04}: {}", String::from_utf8_lossy(&reply)),
            None => println!("request {i:04}: no reply"),
        }
    }

    client.disconnect();
    server.stop().await;
    Ok(())
}
