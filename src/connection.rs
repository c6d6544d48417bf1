//! One live TCP connection: framed read loop plus acknowledged send path.
//!
//! A connection is split in two halves at establishment:
//! - [`Connection`]: a cloneable handle used to send and to close
//! - [`ReadLoop`]: owned by the task that drives the socket's read half
//!
//! Both halves share a [`Shutdown`] signal. Whichever side notices the end
//! first (peer EOF, a read or write error, an unrecoverable framing error, or
//! an explicit close) trips it, which stops the other side and shuts down the
//! write half so the peer sees end of stream.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::framing::{Framer, FramingConfig};
use crate::message::{ConnectionInfo, Message};
use crate::shutdown::Shutdown;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Receives the per-message events of a connection.
///
/// Implementations wrap the endpoint's user handler and are responsible for
/// containing its panics.
pub(crate) trait ConnectionObserver: Send + Sync + 'static {
    /// A whole message arrived. A returned payload is sent back on the same
    /// connection.
    fn on_message(&self, message: &Message) -> Option<Bytes>;

    /// A payload was flushed to the socket.
    fn on_sent(&self, message: &Message);
}

/// Settings shared by every connection of an endpoint.
#[derive(Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) framing: Arc<FramingConfig>,
    pub(crate) socket_buffer_size: usize,
    pub(crate) writer: WriterConfig,
}

#[derive(Clone)]
pub(crate) struct Connection {
    info: Arc<ConnectionInfo>,
    writer: WriterHandle,
    framing: Arc<FramingConfig>,
    shutdown: Shutdown,
    observer: Arc<dyn ConnectionObserver>,
}

impl Connection {
    /// Wire up a connected TCP stream.
    pub(crate) fn from_tcp(
        stream: TcpStream,
        settings: &ConnectionSettings,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<(Self, ReadLoop<tokio::net::tcp::OwnedReadHalf>)> {
        let peer = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, %peer, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Ok(Self::establish(
            reader,
            writer,
            ConnectionInfo::new(peer),
            settings,
            observer,
        ))
    }

    /// Split a byte stream into a send handle and its read loop.
    ///
    /// Spawns the writer task, so this must run inside a Tokio runtime.
    pub(crate) fn establish<R, W>(
        reader: R,
        writer: W,
        info: ConnectionInfo,
        settings: &ConnectionSettings,
        observer: Arc<dyn ConnectionObserver>,
    ) -> (Self, ReadLoop<R>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shutdown = Shutdown::new();
        let (writer, _task) = spawn_writer_task(writer, settings.writer.clone(), shutdown.clone());

        let connection = Self {
            info: Arc::new(info),
            writer,
            framing: settings.framing.clone(),
            shutdown,
            observer,
        };
        let read_loop = ReadLoop {
            reader,
            framer: settings.framing.new_framer(),
            buffer_size: settings.socket_buffer_size.max(1),
            connection: connection.clone(),
        };
        (connection, read_loop)
    }

    #[inline]
    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    #[inline]
    pub(crate) fn id(&self) -> &str {
        &self.info.id
    }

    #[inline]
    pub(crate) fn peer(&self) -> SocketAddr {
        self.info.peer()
    }

    /// Frame `payload` and wait until it is flushed to the socket.
    ///
    /// Returns false if the payload cannot be framed or the connection is
    /// closed before the bytes are written.
    pub(crate) async fn send(&self, payload: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }

        let wire = match self.framing.encode(&payload) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(connection = %self.id(), error = %e, "refusing to send payload");
                return false;
            }
        };

        match self.writer.write(wire).await {
            Ok(()) => {
                trace!(connection = %self.id(), len = payload.len(), "payload sent");
                self.observer.on_sent(&Message::new(payload, self.id()));
                true
            }
            Err(e) => {
                debug!(connection = %self.id(), error = %e, "send failed");
                false
            }
        }
    }

    /// Stop both halves. Returns true only for the call that closed it.
    pub(crate) fn close(&self) -> bool {
        self.shutdown.close()
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_closed()
    }
}

/// Read half of a connection. Consumed by [`ReadLoop::run`].
pub(crate) struct ReadLoop<R> {
    reader: R,
    framer: Box<dyn Framer>,
    buffer_size: usize,
    connection: Connection,
}

impl<R> ReadLoop<R>
where
    R: AsyncRead + Unpin,
{
    /// Read, frame and dispatch until the connection ends.
    ///
    /// Always leaves the connection closed.
    pub(crate) async fn run(mut self) {
        let conn = self.connection.clone();
        let shutdown = conn.shutdown.clone();
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let n = tokio::select! {
                biased;
                _ = shutdown.closed() => break,
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(connection = %conn.id(), "peer closed the connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(connection = %conn.id(), error = %e, "socket read failed");
                        break;
                    }
                },
            };

            let payloads = match self.framer.process_received(&buf[..n]) {
                Ok(payloads) => payloads,
                Err(e) => {
                    error!(connection = %conn.id(), error = %e, "framing failed, closing connection");
                    break;
                }
            };

            for payload in payloads {
                let message = Message::new(payload, conn.id());
                if let Some(reply) = conn.observer.on_message(&message) {
                    conn.send(reply).await;
                }
            }

            if self.framer.is_failed() {
                error!(connection = %conn.id(), "framer cannot resynchronize, closing connection");
                break;
            }
        }

        conn.close();
    }
}
