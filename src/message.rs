//! Connection records and the message envelope.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing between the read loop,
//! event handlers and the correlator.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use layer4_stack::Message;
//!
//! let message = Message::new(Bytes::from_static(b"hello"), "conn-1");
//! assert_eq!(message.payload(), b"hello");
//! assert_eq!(message.connection_id(), "conn-1");
//! ```

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identity of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Generated unique id (UUID v4).
    pub id: String,
    /// Remote address.
    pub address: IpAddr,
    /// Remote port.
    pub port: u16,
    /// When the connection was established.
    pub connected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    /// Record for a connection to `peer`, stamped now, with a fresh id.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address: peer.ip(),
            port: peer.port(),
            connected_at: Utc::now(),
        }
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// A whole message received from, or sent to, one connection.
#[derive(Debug, Clone)]
pub struct Message {
    /// Payload bytes with framing removed.
    pub payload: Bytes,
    /// When the message was received or sent.
    pub timestamp: DateTime<Utc>,
    /// Id of the connection the message belongs to.
    pub connection_id: String,
}

impl Message {
    pub fn new(payload: Bytes, connection_id: impl Into<String>) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            connection_id: connection_id.into(),
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let a = ConnectionInfo::new(peer);
        let b = ConnectionInfo::new(peer);

        assert_ne!(a.id, b.id);
        assert_eq!(a.peer(), peer);
        assert_eq!(a.port, 4000);
    }

    #[test]
    fn test_message_accessors() {
        let message = Message::new(Bytes::from_static(b"abc"), String::from("id"));
        assert_eq!(message.payload(), b"abc");
        assert_eq!(message.connection_id(), "id");
        assert!(message.timestamp <= Utc::now());
    }
}
