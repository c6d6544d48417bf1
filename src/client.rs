//! TCP client engine with optional auto-reconnect and RPC.
//!
//! A client holds at most one live connection. [`Client::rpc`] layers a
//! [`Correlator`] over send and receive: the correlation id is read from the
//! outgoing payload by the framing config, and every inbound payload carrying
//! an id completes the matching pending call.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use layer4_stack::{Client, FramingConfig};
//!
//! #[tokio::main]
//! async fn main() -> layer4_stack::Result<()> {
//!     let client = Client::builder()
//!         .address("127.0.0.1")
//!         .port(1500)
//!         .framing(FramingConfig::hsm()?)
//!         .build()?;
//!
//!     client.connect().await?;
//!     let reply = client.rpc(Bytes::from_static(b"0001NC"), Duration::from_secs(2)).await?;
//!     println!("reply: {reply:?}");
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionObserver, ConnectionSettings, ReadLoop};
use crate::correlator::Correlator;
use crate::error::{Result, TransportError};
use crate::events::{guarded, ClientEventHandler, NoopHandler};
use crate::framing::FramingConfig;
use crate::message::{ConnectionInfo, Message};

/// Connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    framing: Option<FramingConfig>,
    handler: Arc<dyn ClientEventHandler>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            framing: None,
            handler: Arc::new(NoopHandler),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
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

    /// Reconnect in the background every `retry_interval` while disconnected.
    pub fn auto_connect(mut self, retry_interval: Duration) -> Self {
        self.config.auto_connect = true;
        self.config.retry_interval_ms = retry_interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Default: [`FramingConfig::message`]
    pub fn framing(mut self, framing: FramingConfig) -> Self {
        self.framing = Some(framing);
        self
    }

    pub fn handler<H: ClientEventHandler>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Validate the configuration and build a disconnected client.
    ///
    /// With auto-connect enabled the first attempt starts immediately, which
    /// requires a Tokio runtime.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let framing = Arc::new(match self.framing {
            Some(framing) => framing,
            None => FramingConfig::message()?,
        });

        let correlator = Arc::new(Correlator::new());
        let observer: Arc<dyn ConnectionObserver> = Arc::new(ClientObserver {
            framing: framing.clone(),
            correlator: correlator.clone(),
            handler: self.handler.clone(),
        });
        let settings = ConnectionSettings {
            framing,
            socket_buffer_size: self.config.socket_buffer_size,
            writer: self.config.writer_config(),
        };

        let inner = Arc::new(ClientInner {
            config: self.config,
            settings,
            handler: self.handler,
            observer,
            correlator,
            connection: Mutex::new(None),
            connecting: AtomicBool::new(false),
            allow_reconnect: AtomicBool::new(true),
            disconnects: AtomicU64::new(0),
        });

        let auto_connect = if inner.config.auto_connect {
            spawn_auto_connect(&inner)?
        } else {
            None
        };

        Ok(Client {
            inner,
            auto_connect,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A TCP client. Dropping it stops auto-reconnect and closes the connection.
pub struct Client {
    inner: Arc<ClientInner>,
    auto_connect: Option<JoinHandle<()>>,
}

struct ClientInner {
    config: ClientConfig,
    settings: ConnectionSettings,
    handler: Arc<dyn ClientEventHandler>,
    observer: Arc<dyn ConnectionObserver>,
    correlator: Arc<Correlator<Bytes>>,
    connection: Mutex<Option<Connection>>,
    connecting: AtomicBool,
    /// Cleared by an explicit disconnect, set again by connect.
    allow_reconnect: AtomicBool,
    /// Bumped under the connection lock by every explicit disconnect. A dial
    /// that started before the bump must not install its connection.
    disconnects: AtomicU64,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect, replacing any current connection.
    ///
    /// Pending RPCs of the previous connection resolve to `None`. Fails with
    /// [`TransportError::ConnectInProgress`] while another attempt runs.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the connection and suppress auto-reconnect until the next
    /// [`connect`](Self::connect). Returns false if there was no connection.
    pub fn disconnect(&self) -> bool {
        match self.inner.disconnect() {
            Some(connection) => {
                debug!(connection = %connection.id(), "disconnecting");
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Send one payload and wait until it is flushed.
    pub async fn send(&self, payload: impl Into<Bytes>) -> bool {
        match self.inner.current() {
            Some(connection) => connection.send(payload.into()).await,
            None => {
                debug!("send while not connected");
                false
            }
        }
    }

    /// Send a request and wait for the reply carrying the same correlation id.
    ///
    /// Returns `Ok(None)` when the send fails, the id is already pending, or no
    /// reply arrives within `timeout`. Fails only when no correlation id can be
    /// read from `payload`, in which case nothing is sent.
    pub async fn rpc(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<Option<Bytes>> {
        let payload = payload.into();
        let id = self
            .inner
            .settings
            .framing
            .extract_correlation_id(&payload)
            .ok_or(TransportError::MissingCorrelationId)?;

        trace!(correlation_id = %id, ?timeout, "rpc");
        Ok(self
            .inner
            .correlator
            .execute_and_wait(&id, timeout, move || self.send(payload))
            .await)
    }

    pub fn state(&self) -> ClientState {
        if self.inner.connecting.load(Ordering::Acquire) {
            ClientState::Connecting
        } else if self.is_connected() {
            ClientState::Connected
        } else {
            ClientState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Record of the live connection, if any.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.current().map(|c| c.info().clone())
    }

    /// Number of RPCs waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.active_count()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.auto_connect.take() {
            task.abort();
        }
        if let Some(connection) = self.inner.disconnect() {
            connection.close();
        }
        self.inner.correlator.reset();
    }
}

/// Clears the connecting flag when an attempt ends.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ClientInner {
    fn lock_connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Connection> {
        self.lock_connection().clone()
    }

    fn is_connected(&self) -> bool {
        self.lock_connection().as_ref().is_some_and(|c| !c.is_closed())
    }

    fn should_reconnect(&self) -> bool {
        self.allow_reconnect.load(Ordering::Acquire)
            && !self.connecting.load(Ordering::Acquire)
            && !self.is_connected()
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(TransportError::ConnectInProgress);
        }
        let _connecting = ConnectingGuard(&self.connecting);

        self.allow_reconnect.store(true, Ordering::Release);
        let attempt = self.begin_attempt();

        let (connection, read_loop) = match self.dial().await {
            Ok(established) => established,
            Err(e) => {
                warn!(address = %self.config.address, port = self.config.port, error = %e, "connection failed");
                guarded("connection_failure", || self.handler.connection_failure(&e));
                return Err(e);
            }
        };

        self.install(attempt, connection, read_loop)
    }

    /// Drop the current connection and stop auto-reconnect.
    fn disconnect(&self) -> Option<Connection> {
        self.allow_reconnect.store(false, Ordering::Release);
        let mut current = self.lock_connection();
        self.disconnects.fetch_add(1, Ordering::AcqRel);
        current.take()
    }

    /// Close the previous connection and fail its pending RPCs. Returns the
    /// disconnect count the new attempt is checked against.
    fn begin_attempt(&self) -> u64 {
        let (previous, attempt) = {
            let mut current = self.lock_connection();
            (current.take(), self.disconnects.load(Ordering::Acquire))
        };
        if let Some(previous) = previous {
            debug!(connection = %previous.id(), "replacing connection");
            previous.close();
        }
        self.correlator.reset();
        attempt
    }

    /// Make a freshly dialed connection current and start reading from it,
    /// unless an explicit disconnect happened since `attempt` began.
    fn install(
        self: &Arc<Self>,
        attempt: u64,
        connection: Connection,
        read_loop: ReadLoop<OwnedReadHalf>,
    ) -> Result<()> {
        {
            let mut current = self.lock_connection();
            if self.disconnects.load(Ordering::Acquire) != attempt {
                drop(current);
                debug!(connection = %connection.id(), "disconnected while dialing, dropping connection");
                connection.close();
                return Err(TransportError::ConnectionClosed);
            }
            *current = Some(connection.clone());
        }
        info!(connection = %connection.id(), peer = %connection.peer(), "connected");
        guarded("connected", || self.handler.connected(connection.info()));

        let inner = self.clone();
        tokio::spawn(async move {
            read_loop.run().await;
            inner.release(&connection);
            debug!(connection = %connection.id(), "disconnected");
            guarded("disconnected", || inner.handler.disconnected(connection.info()));
        });
        Ok(())
    }

    async fn dial(&self) -> Result<(Connection, ReadLoop<OwnedReadHalf>)> {
        let stream = TcpStream::connect((self.config.address.as_str(), self.config.port)).await?;
        Connection::from_tcp(stream, &self.settings, self.observer.clone())
    }

    /// Forget `connection` if it is still the current one.
    fn release(&self, connection: &Connection) {
        let mut current = self.lock_connection();
        if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
            *current = None;
        }
    }
}

fn spawn_auto_connect(inner: &Arc<ClientInner>) -> Result<Option<JoinHandle<()>>> {
    let runtime = Handle::try_current().map_err(|_| {
        TransportError::InvalidConfig("auto_connect requires a Tokio runtime".to_string())
    })?;
    let inner: Weak<ClientInner> = Arc::downgrade(inner);

    Ok(Some(runtime.spawn(async move {
        let Some(period) = inner.upgrade().map(|i| i.config.retry_interval()) else {
            return;
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.should_reconnect() {
                debug!("auto-connect attempt");
                if let Err(e) = inner.connect().await {
                    debug!(error = %e, "auto-connect attempt failed");
                }
            }
        }
    })))
}

struct ClientObserver {
    framing: Arc<FramingConfig>,
    correlator: Arc<Correlator<Bytes>>,
    handler: Arc<dyn ClientEventHandler>,
}

impl ConnectionObserver for ClientObserver {
    fn on_message(&self, message: &Message) -> Option<Bytes> {
        if let Some(id) = self.framing.extract_correlation_id(message.payload()) {
            if self.correlator.notify_result(&id, message.payload.clone()) {
                trace!(correlation_id = %id, "rpc reply delivered");
            }
        }
        guarded("message_received", || self.handler.message_received(message)).flatten()
    }

    fn on_sent(&self, message: &Message) {
        guarded("message_sent", || self.handler.message_sent(message));
    }
}
