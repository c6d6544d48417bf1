//! Message framing - turns a chunked byte stream into whole messages and back.
//!
//! Two strategies implement the [`Framer`] contract:
//! - [`MessageFramer`]: optional 2-byte length header and/or terminator, with
//!   resynchronization after corrupted input
//! - [`SimpleFramer`]: `[0x00][N-byte length][payload]`
//!
//! A [`FramingConfig`] is shared by every connection of an endpoint. Each
//! connection's read loop owns its own framer built from it, while the send
//! path only needs the immutable config to encode.

pub mod message;
pub mod simple;
pub mod wire;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

pub use message::{MessageFramer, MessageFramerConfig, DEFAULT_MAX_MESSAGE_LENGTH};
pub use simple::{SimpleFramer, SimpleFramerConfig};

/// Stateful per-connection message framer.
pub trait Framer: Send {
    /// Consume a raw chunk and return every message it completes, in order.
    ///
    /// An error is fatal for the connection: the framer cannot make progress.
    /// When the framer fails after completing some messages it returns them
    /// and reports the failure through [`is_failed`](Self::is_failed).
    fn process_received(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>>;

    /// True once the framer can make no further progress. The caller should
    /// dispatch what it was last given and then close the connection.
    fn is_failed(&self) -> bool {
        false
    }

    /// Encode an outgoing payload into wire bytes.
    fn encode(&self, payload: &[u8]) -> Result<Bytes>;

    /// Correlation id of a decoded payload, if the config knows how to find one.
    fn extract_correlation_id(&self, payload: &[u8]) -> Option<String>;

    /// Drop any buffered bytes and return to the synchronized state.
    fn reset(&mut self);
}

/// Extracts a correlation id from a raw payload.
#[derive(Clone)]
pub struct CorrelationExtractor(Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>);

impl CorrelationExtractor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Uses the first `len` bytes as the id once a payload reaches `min_payload` bytes.
    ///
    /// Printable ASCII is kept as is; every other byte is `\x`-escaped, so
    /// distinct binary prefixes always give distinct ids.
    pub fn prefix(len: usize, min_payload: usize) -> Self {
        Self::new(move |payload| {
            if payload.len() < min_payload.max(len) {
                return None;
            }
            Some(payload[..len].escape_ascii().to_string())
        })
    }

    #[inline]
    pub fn extract(&self, payload: &[u8]) -> Option<String> {
        (self.0)(payload)
    }
}

impl fmt::Debug for CorrelationExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CorrelationExtractor(..)")
    }
}

/// Framing strategy and its parameters.
#[derive(Debug, Clone)]
pub enum FramingConfig {
    Message(MessageFramerConfig),
    Simple(SimpleFramerConfig),
}

impl FramingConfig {
    /// ISO 8583 style: 2-byte length header plus `0x03` terminator.
    pub fn iso8583() -> Result<Self> {
        MessageFramerConfig::new(DEFAULT_MAX_MESSAGE_LENGTH, Some(&[0x03]), true).map(Self::Message)
    }

    /// HSM command framing: 1-byte length, 500-byte buffer, 4-byte id prefix.
    pub fn hsm() -> Result<Self> {
        Ok(Self::Simple(
            SimpleFramerConfig::new(1, simple::HSM_BUFFER_SIZE)?
                .with_correlation(CorrelationExtractor::prefix(4, 6)),
        ))
    }

    /// Generic simple framing with a 2-byte length.
    pub fn message() -> Result<Self> {
        SimpleFramerConfig::new(2, simple::MESSAGE_BUFFER_SIZE).map(Self::Simple)
    }

    /// Build a fresh framer for a new connection.
    pub fn new_framer(&self) -> Box<dyn Framer> {
        match self {
            Self::Message(config) => Box::new(MessageFramer::new(config.clone())),
            Self::Simple(config) => Box::new(SimpleFramer::new(config.clone())),
        }
    }

    /// Encode a payload without touching any connection's receive state.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        match self {
            Self::Message(config) => config.encode(payload),
            Self::Simple(config) => config.encode(payload),
        }
    }

    pub fn extract_correlation_id(&self, payload: &[u8]) -> Option<String> {
        let extractor = match self {
            Self::Message(config) => config.correlation.as_ref(),
            Self::Simple(config) => config.correlation.as_ref(),
        };
        extractor.and_then(|e| e.extract(payload))
    }

    /// Install a correlation id extractor on either strategy.
    pub fn with_correlation(self, extractor: CorrelationExtractor) -> Self {
        match self {
            Self::Message(config) => Self::Message(config.with_correlation(extractor)),
            Self::Simple(config) => Self::Simple(config.with_correlation(extractor)),
        }
    }
}

impl From<MessageFramerConfig> for FramingConfig {
    fn from(config: MessageFramerConfig) -> Self {
        Self::Message(config)
    }
}

impl From<SimpleFramerConfig> for FramingConfig {
    fn from(config: SimpleFramerConfig) -> Self {
        Self::Simple(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hsm_correlation_prefix() {
        let config = FramingConfig::hsm().unwrap();
        assert_eq!(
            config.extract_correlation_id(b"ABCDxx"),
            Some("ABCD".to_string())
        );
        assert_eq!(config.extract_correlation_id(b"ABCDx"), None);
    }

    #[test]
    fn test_binary_prefixes_stay_distinct() {
        let extractor = CorrelationExtractor::prefix(4, 4);
        let first = extractor.extract(&[0xFE, 0, 0, 1]).unwrap();
        let second = extractor.extract(&[0xFF, 0, 0, 1]).unwrap();

        assert_ne!(first, second);
        assert_eq!(first, "\\xfe\\x00\\x00\\x01");
        assert_ne!(extractor.extract(b"\\xfe\\x00").unwrap(), first);
    }

    #[test]
    fn test_iso8583_round_trip() {
        let config = FramingConfig::iso8583().unwrap();
        let wire = config.encode(b"0200").unwrap();
        assert_eq!(&wire[..], &[0, 5, b'0', b'2', b'0', b'0', 0x03]);

        let mut framer = config.new_framer();
        let messages = framer.process_received(&wire).unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"0200")]);
    }

    #[test]
    fn test_message_preset_encoding() {
        let config = FramingConfig::message().unwrap();
        let wire = config.encode(b"hi").unwrap();
        assert_eq!(&wire[..], &[0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_no_extractor_yields_none() {
        let config = FramingConfig::message().unwrap();
        assert_eq!(config.extract_correlation_id(b"anything"), None);
    }

    #[test]
    fn test_with_correlation_applies_to_strategy() {
        let config = FramingConfig::message()
            .unwrap()
            .with_correlation(CorrelationExtractor::new(|p| p.first().map(|b| b.to_string())));
        assert_eq!(config.extract_correlation_id(&[7, 1]), Some("7".to_string()));

        let framer = config.new_framer();
        assert_eq!(framer.extract_correlation_id(&[9]), Some("9".to_string()));
    }
}
