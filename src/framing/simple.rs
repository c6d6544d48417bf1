//! Start-marker plus fixed-width length framer.
//!
//! Each message is `[0x00][N-byte BE length][payload]` with `N` in `1..=3`.
//! The receiver scans for the start marker, so bytes between messages are
//! skipped and the stream realigns on its own after corruption.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use super::wire::{
    header_to_length, length_to_header, max_length_for_width, MAX_SIMPLE_HEADER_WIDTH,
    MIN_SIMPLE_HEADER_WIDTH, START_MARKER,
};
use super::{CorrelationExtractor, Framer};
use crate::buffer;
use crate::error::{Result, TransportError};

/// Buffer capacity of the HSM preset.
pub const HSM_BUFFER_SIZE: usize = 500;

/// Buffer capacity of the generic 2-byte preset: one maximal message.
pub const MESSAGE_BUFFER_SIZE: usize = 1 + 2 + 65_535;

#[derive(Debug, Clone)]
pub struct SimpleFramerConfig {
    header_width: usize,
    buffer_capacity: usize,
    pub(crate) correlation: Option<CorrelationExtractor>,
}

impl SimpleFramerConfig {
    pub fn new(header_width: usize, buffer_capacity: usize) -> Result<Self> {
        if !(MIN_SIMPLE_HEADER_WIDTH..=MAX_SIMPLE_HEADER_WIDTH).contains(&header_width) {
            return Err(TransportError::InvalidConfig(format!(
                "length header width must be {}..={}, got {}",
                MIN_SIMPLE_HEADER_WIDTH, MAX_SIMPLE_HEADER_WIDTH, header_width
            )));
        }
        if buffer_capacity <= 1 + header_width {
            return Err(TransportError::InvalidConfig(format!(
                "buffer capacity {} leaves no room for a payload",
                buffer_capacity
            )));
        }
        Ok(Self {
            header_width,
            buffer_capacity,
            correlation: None,
        })
    }

    pub fn with_correlation(mut self, extractor: CorrelationExtractor) -> Self {
        self.correlation = Some(extractor);
        self
    }

    pub fn header_width(&self) -> usize {
        self.header_width
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Largest payload that both the header and the receive buffer can hold.
    pub fn max_payload(&self) -> usize {
        max_length_for_width(self.header_width).min(self.buffer_capacity - 1 - self.header_width)
    }

    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        let max = self.max_payload();
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let mut wire = BytesMut::with_capacity(1 + self.header_width + payload.len());
        wire.put_u8(START_MARKER);
        wire.put_slice(&length_to_header(payload.len(), self.header_width)?);
        wire.put_slice(payload);
        Ok(wire.freeze())
    }
}

pub struct SimpleFramer {
    config: SimpleFramerConfig,
    buffer: Vec<u8>,
    filled: usize,
}

impl SimpleFramer {
    pub fn new(config: SimpleFramerConfig) -> Self {
        Self {
            buffer: vec![0u8; config.buffer_capacity],
            filled: 0,
            config,
        }
    }

    pub fn config(&self) -> &SimpleFramerConfig {
        &self.config
    }

    /// Number of buffered bytes not yet part of a complete message.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Extract complete messages and return the number of consumed bytes.
    fn extract(&self, out: &mut Vec<Bytes>) -> Result<usize> {
        let width = self.config.header_width;
        let data = &self.buffer[..self.filled];
        let mut pos = 0;

        loop {
            let Some(marker) = buffer::find_first_occurrence(data, &[START_MARKER], None, pos) else {
                if pos < data.len() {
                    warn!(skipped = data.len() - pos, "discarding bytes without start marker");
                }
                return Ok(data.len());
            };
            if marker > pos {
                warn!(skipped = marker - pos, "skipping bytes before start marker");
            }

            let body_start = marker + 1 + width;
            if body_start > data.len() {
                return Ok(marker);
            }

            let declared = header_to_length(&data[marker + 1..body_start])?;
            if declared == 0 || body_start + declared > self.buffer.len() {
                // Not a real header: treat the marker byte as noise.
                warn!(declared, at = marker, "corrupt length after start marker");
                pos = marker + 1;
                continue;
            }

            let end = body_start + declared;
            if end > data.len() {
                return Ok(marker);
            }

            out.push(Bytes::copy_from_slice(buffer::slice(
                data,
                body_start as isize,
                declared as isize,
            )));
            pos = end;
        }
    }

    fn compact(&mut self, consumed: usize) {
        if consumed == 0 {
            return;
        }
        let remaining = self.filled - consumed;
        buffer::move_within(&mut self.buffer, consumed as isize, 0, Some(remaining));
        self.filled = remaining;
    }
}

impl Framer for SimpleFramer {
    fn process_received(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        let mut messages = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            if self.filled == self.buffer.len() {
                warn!(
                    capacity = self.buffer.len(),
                    "message buffer overflow, discarding buffered bytes"
                );
                self.filled = 0;
            }

            let copied = buffer::replace_with(&mut self.buffer, rest, 0, self.filled as isize, None);
            self.filled += copied;
            rest = &rest[copied..];
            trace!(bytes = copied, buffered = self.filled, "buffered chunk");

            let consumed = self.extract(&mut messages)?;
            self.compact(consumed);
        }

        Ok(messages)
    }

    fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        self.config.encode(payload)
    }

    fn extract_correlation_id(&self, payload: &[u8]) -> Option<String> {
        self.config
            .correlation
            .as_ref()
            .and_then(|extractor| extractor.extract(payload))
    }

    fn reset(&mut self) {
        self.filled = 0;
    }
}
