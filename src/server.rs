//! TCP server engine.
//!
//! The server binds a listener, accepts connections in a background task and
//! runs one read loop task per client. Live clients are kept in a registry
//! keyed by connection id, which backs unicast, broadcast and disconnect.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use layer4_stack::{FramingConfig, Message, Server, ServerEventHandler};
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
//!         .port(8583)
//!         .framing(FramingConfig::iso8583()?)
//!         .handler(Echo)
//!         .build()?;
//!
//!     let addr = server.start().await?;
//!     println!("listening on {addr}");
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionObserver, ConnectionSettings, ReadLoop};
use crate::error::Result;
use crate::events::{guarded, NoopHandler, ServerEventHandler};
use crate::framing::FramingConfig;
use crate::message::{ConnectionInfo, Message};
use crate::shutdown::Shutdown;

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    framing: Option<FramingConfig>,
    handler: Arc<dyn ServerEventHandler>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            framing: None,
            handler: Arc::new(NoopHandler),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn socket_buffer_size(mut self, size: usize) -> Self {
        self.config.socket_buffer_size = size;
        self
    }

    /// Framing used by every client connection.
    ///
    /// Default: [`FramingConfig::message`]
    pub fn framing(mut self, framing: FramingConfig) -> Self {
        self.framing = Some(framing);
        self
    }

    pub fn handler<H: ServerEventHandler>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Validate the configuration and build a stopped server.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        let framing = match self.framing {
            Some(framing) => framing,
            None => FramingConfig::message()?,
        };

        let settings = ConnectionSettings {
            framing: Arc::new(framing),
            socket_buffer_size: self.config.socket_buffer_size,
            writer: self.config.writer_config(),
        };
        let observer = Arc::new(ServerObserver {
            handler: self.handler.clone(),
        });

        Ok(Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                settings,
                handler: self.handler,
                observer,
                status: Mutex::new(Status {
                    state: ServerState::Stopped,
                    local_addr: None,
                }),
                running: tokio::sync::Mutex::new(None),
                clients: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A TCP server. Dropping it closes the listener and every client.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    settings: ConnectionSettings,
    handler: Arc<dyn ServerEventHandler>,
    observer: Arc<ServerObserver>,
    status: Mutex<Status>,
    /// Serializes start and stop.
    running: tokio::sync::Mutex<Option<Running>>,
    clients: Mutex<HashMap<String, Connection>>,
}

struct Status {
    state: ServerState,
    local_addr: Option<SocketAddr>,
}

struct Running {
    shutdown: Shutdown,
    accept_task: JoinHandle<()>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind and start accepting clients. Returns the bound address.
    ///
    /// Starting a server that is already listening returns its address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        if let Some(addr) = running.as_ref().and(self.local_addr()) {
            return Ok(addr);
        }

        inner.set_status(ServerState::Starting, None);
        let (listener, addr) = match inner.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                warn!(address = %inner.config.address, port = inner.config.port, error = %e, "server failed to start");
                inner.set_status(ServerState::Stopped, None);
                guarded("server_start_failure", || inner.handler.server_start_failure(&e));
                return Err(e);
            }
        };

        let shutdown = Shutdown::new();
        inner.set_status(ServerState::Listening, Some(addr));
        info!(%addr, "server listening");
        guarded("server_started", || inner.handler.server_started(addr));

        let accept_task = tokio::spawn(accept_loop(inner.clone(), listener, shutdown.clone()));
        *running = Some(Running {
            shutdown,
            accept_task,
        });
        Ok(addr)
    }

    /// Stop accepting and close every client. No-op when not started.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        let Some(Running {
            shutdown,
            accept_task,
        }) = running.take()
        else {
            return;
        };

        inner.set_status(ServerState::Stopping, self.local_addr());
        shutdown.close();
        if let Err(e) = accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }

        let clients = inner.drain_clients();
        for client in &clients {
            client.close();
        }

        inner.set_status(ServerState::Stopped, None);
        info!(clients = clients.len(), "server stopped");
        guarded("server_stopped", || inner.handler.server_stopped());
    }

    /// Close one client. Returns false if no such client is registered.
    pub fn disconnect_client(&self, id: &str) -> bool {
        let removed = self.inner.lock_clients().remove(id);
        match removed {
            Some(client) => {
                debug!(connection = id, "disconnecting client");
                client.close();
                true
            }
            None => false,
        }
    }

    /// Send to one client and wait until the bytes are flushed.
    pub async fn send_to_client(&self, id: &str, payload: impl Into<Bytes>) -> bool {
        let client = self.inner.lock_clients().get(id).cloned();
        match client {
            Some(client) => client.send(payload.into()).await,
            None => false,
        }
    }

    /// Send to every registered client. Returns how many sends succeeded.
    ///
    /// Clients that connect or disconnect during the broadcast may or may
    /// not be included.
    pub async fn send_to_all(&self, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let clients: Vec<Connection> = self.inner.lock_clients().values().cloned().collect();

        join_all(clients.iter().map(|client| client.send(payload.clone())))
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count()
    }

    /// Snapshot of the registered clients.
    pub fn clients(&self) -> Vec<ConnectionInfo> {
        self.inner
            .lock_clients()
            .values()
            .map(|client| client.info().clone())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock_clients().len()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock_status().local_addr
    }

    pub fn state(&self) -> ServerState {
        self.inner.lock_status().state
    }

    pub fn is_started(&self) -> bool {
        self.state() == ServerState::Listening
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Ok(mut running) = self.inner.running.try_lock() {
            if let Some(running) = running.take() {
                running.shutdown.close();
            }
        }
        for client in self.inner.drain_clients() {
            client.close();
        }
    }
}

impl ServerInner {
    async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind((self.config.address.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        Ok((listener, addr))
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: ServerState, local_addr: Option<SocketAddr>) {
        let mut status = self.lock_status();
        status.state = state;
        status.local_addr = local_addr;
    }

    fn drain_clients(&self) -> Vec<Connection> {
        self.lock_clients().drain().map(|(_, client)| client).collect()
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, shutdown: &Shutdown) {
        let observer: Arc<dyn ConnectionObserver> = self.observer.clone();
        match Connection::from_tcp(stream, &self.settings, observer) {
            Ok((client, read_loop)) => {
                tokio::spawn(serve_client(self.clone(), client, read_loop, shutdown.clone()));
            }
            Err(e) => warn!(error = %e, "failed to set up accepted connection"),
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, shutdown: Shutdown) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    inner.accept(stream, &shutdown);
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    debug!("accept loop stopped");
}

async fn serve_client<R>(
    inner: Arc<ServerInner>,
    client: Connection,
    read_loop: ReadLoop<R>,
    shutdown: Shutdown,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    inner
        .lock_clients()
        .insert(client.id().to_string(), client.clone());
    // A stop that raced this accept has already drained the registry.
    if shutdown.is_closed() {
        client.close();
    }

    info!(connection = %client.id(), peer = %client.peer(), "client connected");
    guarded("client_connected", || inner.handler.client_connected(client.info()));

    read_loop.run().await;

    inner.lock_clients().remove(client.id());
    debug!(connection = %client.id(), "client disconnected");
    guarded("client_disconnected", || inner.handler.client_disconnected(client.info()));
}

struct ServerObserver {
    handler: Arc<dyn ServerEventHandler>,
}

impl ConnectionObserver for ServerObserver {
    fn on_message(&self, message: &Message) -> Option<Bytes> {
        guarded("message_received", || self.handler.message_received(message)).flatten()
    }

    fn on_sent(&self, message: &Message) {
        guarded("message_sent", || self.handler.message_sent(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    fn server() -> Server {
        Server::builder().port(0).build().unwrap()
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = Server::builder().socket_buffer_size(0).build();
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[test]
    fn test_new_server_is_stopped() {
        let server = server();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.is_started());
        assert!(server.local_addr().is_none());
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let server = server();

        let first = server.start().await.unwrap();
        let second = server.start().await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first.port(), 0);
        assert_eq!(server.state(), ServerState::Listening);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_then_restart() {
        let server = server();
        server.start().await.unwrap();
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());

        server.start().await.unwrap();
        assert!(server.is_started());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let server = server();
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_client_operations() {
        let server = server();
        server.start().await.unwrap();

        assert!(!server.disconnect_client("missing"));
        assert!(!server.send_to_client("missing", Bytes::from_static(b"x")).await);
        assert_eq!(server.send_to_all(Bytes::from_static(b"x")).await, 0);
        server.stop().await;
    }
}
