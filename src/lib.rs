//! # layer4-stack
//!
//! TCP transport layer that turns a raw byte stream into whole application
//! messages, for both server and client roles, with request/response
//! correlation on top.
//!
//! ## Architecture
//!
//! - **Framing**: per-connection state machines that reassemble messages from
//!   arbitrarily chunked reads (length header, terminator, or both; or a
//!   start marker plus fixed-width length)
//! - **Connections**: one read loop task and one writer task per socket
//! - **Server / Client**: accept loop and client registry; single outbound
//!   connection with auto-reconnect and RPC
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use layer4_stack::{Client, FramingConfig, Message, Server, ServerEventHandler};
//!
//! struct Echo;
//!
//! impl ServerEventHandler for Echo {
//!     fn message_received(&self, message: &Message) -> Option<Bytes> {
//!         Some(message.payload.clone())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> layer4_stack::Result<()> {
//!     let server = Server::builder()
//!         .framing(FramingConfig::hsm()?)
//!         .handler(Echo)
//!         .build()?;
//!     let addr = server.start().await?;
//!
//!     let client = Client::builder()
//!         .port(addr.port())
//!         .framing(FramingConfig::hsm()?)
//!         .build()?;
//!     client.connect().await?;
//!
//!     let reply = client.rpc(Bytes::from_static(b"0001NC"), Duration::from_secs(1)).await?;
//!     assert_eq!(reply.as_deref(), Some(&b"0001NC"[..]));
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod framing;
pub mod message;

mod client;
mod connection;
mod server;
mod shutdown;
mod writer;

pub use client::{Client, ClientBuilder, ClientState};
pub use config::{ClientConfig, ServerConfig};
pub use correlator::Correlator;
pub use error::{Result, TransportError};
pub use events::{ClientEventHandler, NoopHandler, ServerEventHandler};
pub use framing::{CorrelationExtractor, Framer, FramingConfig};
pub use message::{ConnectionInfo, Message};
pub use server::{Server, ServerBuilder, ServerState};
pub use writer::WriterConfig;
