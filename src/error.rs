//! Error types for layer4-stack.

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing or endpoint configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Outgoing payload cannot be represented in the configured wire format.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Empty payloads have no representation on the wire.
    #[error("Empty payload")]
    EmptyPayload,

    /// Length value does not fit in a header of the requested width.
    #[error("Length {length} does not fit in a {width}-byte header")]
    HeaderOverflow { length: usize, width: usize },

    /// Length header is wider than the platform word.
    #[error("Length header of {0} bytes is too wide")]
    HeaderTooWide(usize),

    /// Framer lost alignment and has no terminator or synchronizer to recover with.
    #[error("Framer lost synchronization and has no recovery pattern")]
    Unsynchronizable,

    /// No correlation id could be extracted from an outgoing RPC payload.
    #[error("No correlation id in payload")]
    MissingCorrelationId,

    /// Another connect attempt is already running.
    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    /// Connection closed before the operation completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - send queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
