//! Endpoint configuration.
//!
//! Both configs deserialize from JSON with every field optional:
//!
//! ```
//! use layer4_stack::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{"port": 9000, "auto_connect": true}"#).unwrap();
//! assert_eq!(config.port, 9000);
//! assert_eq!(config.socket_buffer_size, 5000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES};

/// Default size of the per-connection socket read buffer.
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 5000;

/// Default interval between automatic reconnect attempts.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 5000;

/// Default time a send may wait for room in the send queue.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;

const DEFAULT_ADDRESS: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub address: String,
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Bytes requested per socket read.
    pub socket_buffer_size: usize,
    /// Queued sends per connection before senders wait.
    pub max_pending_sends: usize,
    /// How long a send waits for queue space.
    pub send_timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(&self.address, self.socket_buffer_size, self.max_pending_sends)
    }

    pub fn writer_config(&self) -> WriterConfig {
        writer_config(self.max_pending_sends, self.send_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: 0,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            max_pending_sends: DEFAULT_MAX_PENDING_FRAMES,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address.
    pub address: String,
    /// Server port.
    pub port: u16,
    /// Bytes requested per socket read.
    pub socket_buffer_size: usize,
    /// Reconnect in the background whenever the connection is down.
    pub auto_connect: bool,
    /// Interval between reconnect checks.
    pub retry_interval_ms: u64,
    /// Queued sends before senders wait.
    pub max_pending_sends: usize,
    /// How long a send waits for queue space.
    pub send_timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(&self.address, self.socket_buffer_size, self.max_pending_sends)?;
        if self.retry_interval_ms == 0 {
            return Err(TransportError::InvalidConfig(
                "retry_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn writer_config(&self) -> WriterConfig {
        writer_config(self.max_pending_sends, self.send_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: 0,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            auto_connect: false,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_pending_sends: DEFAULT_MAX_PENDING_FRAMES,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

fn validate_common(address: &str, socket_buffer_size: usize, max_pending_sends: usize) -> Result<()> {
    if address.is_empty() {
        return Err(TransportError::InvalidConfig("address is empty".to_string()));
    }
    if socket_buffer_size == 0 {
        return Err(TransportError::InvalidConfig(
            "socket_buffer_size must be positive".to_string(),
        ));
    }
    if max_pending_sends == 0 {
        return Err(TransportError::InvalidConfig(
            "max_pending_sends must be positive".to_string(),
        ));
    }
    Ok(())
}

fn writer_config(max_pending_sends: usize, send_timeout_ms: u64) -> WriterConfig {
    WriterConfig {
        max_pending_frames: max_pending_sends,
        channel_capacity: max_pending_sends.min(DEFAULT_CHANNEL_CAPACITY),
        backpressure_timeout: Duration::from_millis(send_timeout_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 0);
        assert_eq!(config.socket_buffer_size, DEFAULT_SOCKET_BUFFER_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_from_json_fills_defaults() {
        let config =
            ClientConfig::from_json(r#"{"address": "10.0.0.5", "port": 7000, "auto_connect": true}"#)
                .unwrap();

        assert_eq!(config.address, "10.0.0.5");
        assert_eq!(config.port, 7000);
        assert!(config.auto_connect);
        assert_eq!(config.retry_interval(), Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS));
    }

    #[test]
    fn test_from_json_rejects_invalid_values() {
        assert!(matches!(
            ServerConfig::from_json(r#"{"socket_buffer_size": 0}"#),
            Err(TransportError::InvalidConfig(_))
        ));
        assert!(matches!(
            ClientConfig::from_json(r#"{"retry_interval_ms": 0}"#),
            Err(TransportError::InvalidConfig(_))
        ));
        assert!(matches!(
            ClientConfig::from_json("not json"),
            Err(TransportError::Json(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = ServerConfig::new("0.0.0.0", 8583);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ServerConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_writer_config_mapping() {
        let config = ClientConfig {
            max_pending_sends: 16,
            send_timeout_ms: 250,
            ..ClientConfig::default()
        };
        let writer = config.writer_config();
        assert_eq!(writer.max_pending_frames, 16);
        assert_eq!(writer.channel_capacity, 16);
        assert_eq!(writer.backpressure_timeout, Duration::from_millis(250));
    }
}
