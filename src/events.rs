//! Event handler traits for server and client endpoints.
//!
//! Handlers are plain synchronous callbacks invoked from connection tasks.
//! Every method has a no-op default, so implementors only override what they
//! need. A handler that panics is logged and ignored; it never takes the
//! connection or the endpoint down with it.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use layer4_stack::{Message, ServerEventHandler};
//!
//! struct Echo;
//!
//! impl ServerEventHandler for Echo {
//!     fn message_received(&self, message: &Message) -> Option<Bytes> {
//!         Some(message.payload.clone())
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::error;

use crate::error::TransportError;
use crate::message::{ConnectionInfo, Message};

/// Callbacks raised by a [`Server`](crate::Server).
pub trait ServerEventHandler: Send + Sync + 'static {
    fn client_connected(&self, _client: &ConnectionInfo) {}

    fn client_disconnected(&self, _client: &ConnectionInfo) {}

    /// A whole message arrived. A returned payload is sent back to the same
    /// client immediately.
    fn message_received(&self, _message: &Message) -> Option<Bytes> {
        None
    }

    fn message_sent(&self, _message: &Message) {}

    fn server_started(&self, _addr: SocketAddr) {}

    fn server_start_failure(&self, _error: &TransportError) {}

    fn server_stopped(&self) {}
}

/// Callbacks raised by a [`Client`](crate::Client).
pub trait ClientEventHandler: Send + Sync + 'static {
    fn connected(&self, _connection: &ConnectionInfo) {}

    fn connection_failure(&self, _error: &TransportError) {}

    fn disconnected(&self, _connection: &ConnectionInfo) {}

    /// A whole message arrived. A returned payload is sent back immediately.
    fn message_received(&self, _message: &Message) -> Option<Bytes> {
        None
    }

    fn message_sent(&self, _message: &Message) {}
}

/// Handler that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl ServerEventHandler for NoopHandler {}

impl ClientEventHandler for NoopHandler {}

impl<H: ServerEventHandler + ?Sized> ServerEventHandler for Arc<H> {
    fn client_connected(&self, client: &ConnectionInfo) {
        (**self).client_connected(client)
    }

    fn client_disconnected(&self, client: &ConnectionInfo) {
        (**self).client_disconnected(client)
    }

    fn message_received(&self, message: &Message) -> Option<Bytes> {
        (**self).message_received(message)
    }

    fn message_sent(&self, message: &Message) {
        (**self).message_sent(message)
    }

    fn server_started(&self, addr: SocketAddr) {
        (**self).server_started(addr)
    }

    fn server_start_failure(&self, error: &TransportError) {
        (**self).server_start_failure(error)
    }

    fn server_stopped(&self) {
        (**self).server_stopped()
    }
}

impl<H: ClientEventHandler + ?Sized> ClientEventHandler for Arc<H> {
    fn connected(&self, connection: &ConnectionInfo) {
        (**self).connected(connection)
    }

    fn connection_failure(&self, error: &TransportError) {
        (**self).connection_failure(error)
    }

    fn disconnected(&self, connection: &ConnectionInfo) {
        (**self).disconnected(connection)
    }

    fn message_received(&self, message: &Message) -> Option<Bytes> {
        (**self).message_received(message)
    }

    fn message_sent(&self, message: &Message) {
        (**self).message_sent(message)
    }
}

/// Run a handler callback, containing any panic it raises.
pub(crate) fn guarded<R>(event: &'static str, callback: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(event, "event handler panicked");
            None
        }
    }
}
