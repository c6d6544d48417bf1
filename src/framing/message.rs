//! Terminator / length-header message framer.
//!
//! Wire layout: `[2-byte BE length (optional)][payload][terminator (optional)]`,
//! where the length counts payload plus terminator. At least one of the two
//! boundary markers must be configured.
//!
//! The framer keeps a fixed-capacity accumulation buffer. Incoming chunks are
//! appended piecewise; after each append every complete message is extracted
//! and the unconsumed tail is shifted to the front. When the buffer fills up
//! without yielding a message, or a length header is out of range, the framer
//! drops to the unsynchronized state and recovers alignment using the
//! terminator or, failing that, the synchronizer pattern.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::wire::{length_to_header, read_length_header, LENGTH_HEADER_SIZE};
use super::{CorrelationExtractor, Framer};
use crate::buffer;
use crate::error::{Result, TransportError};

/// Default accumulation buffer capacity (and largest wire message).
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 5000;

/// Configuration for [`MessageFramer`]. Validated at construction.
#[derive(Debug, Clone)]
pub struct MessageFramerConfig {
    max_length: usize,
    terminator: Option<Vec<u8>>,
    use_length_header: bool,
    synchronizer: Option<Vec<u8>>,
    pub(crate) correlation: Option<CorrelationExtractor>,
}

impl MessageFramerConfig {
    /// Create a config.
    ///
    /// `max_length` is the buffer capacity and therefore the largest encoded
    /// message. An empty terminator counts as no terminator.
    pub fn new(
        max_length: usize,
        terminator: Option<&[u8]>,
        use_length_header: bool,
    ) -> Result<Self> {
        let terminator = terminator.filter(|t| !t.is_empty()).map(<[u8]>::to_vec);
        if terminator.is_none() && !use_length_header {
            return Err(TransportError::InvalidConfig(
                "message framing needs a terminator or a length header".to_string(),
            ));
        }

        let config = Self {
            max_length,
            terminator,
            use_length_header,
            synchronizer: None,
            correlation: None,
        };

        let overhead = config.header_len() + config.terminator_len();
        if max_length <= overhead {
            return Err(TransportError::InvalidConfig(format!(
                "max length {} leaves no room for a payload after {} bytes of framing",
                max_length, overhead
            )));
        }
        Ok(config)
    }

    /// Pattern used to regain alignment when no terminator is configured.
    ///
    /// The pattern is expected at the start of every payload, directly after
    /// the length header.
    pub fn with_synchronizer(mut self, synchronizer: &[u8]) -> Self {
        self.synchronizer = (!synchronizer.is_empty()).then(|| synchronizer.to_vec());
        self
    }

    pub fn with_correlation(mut self, extractor: CorrelationExtractor) -> Self {
        self.correlation = Some(extractor);
        self
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn terminator(&self) -> Option<&[u8]> {
        self.terminator.as_deref()
    }

    pub fn uses_length_header(&self) -> bool {
        self.use_length_header
    }

    pub fn synchronizer(&self) -> Option<&[u8]> {
        self.synchronizer.as_deref()
    }

    #[inline]
    fn header_len(&self) -> usize {
        if self.use_length_header {
            LENGTH_HEADER_SIZE
        } else {
            0
        }
    }

    #[inline]
    fn terminator_len(&self) -> usize {
        self.terminator.as_ref().map_or(0, Vec::len)
    }

    /// Encode a payload into wire bytes.
    ///
    /// Empty payloads are rejected: the receiver treats a zero-length body as
    /// a format inconsistency.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }

        let size = self.header_len() + payload.len() + self.terminator_len();
        if size > self.max_length {
            return Err(TransportError::PayloadTooLarge {
                size,
                max: self.max_length,
            });
        }

        let mut wire = BytesMut::with_capacity(size);
        if self.use_length_header {
            let declared = payload.len() + self.terminator_len();
            wire.put_slice(&length_to_header(declared, LENGTH_HEADER_SIZE)?);
        }
        wire.put_slice(payload);
        if let Some(terminator) = &self.terminator {
            wire.put_slice(terminator);
        }
        Ok(wire.freeze())
    }
}

/// Stateful terminator / length-header framer for one connection.
pub struct MessageFramer {
    config: MessageFramerConfig,
    /// Fixed-capacity accumulation buffer; only `..filled` is meaningful.
    buffer: Vec<u8>,
    filled: usize,
    synchronized: bool,
    /// Set once resync is impossible; only [`Framer::reset`] clears it.
    failed: bool,
}

impl MessageFramer {
    pub fn new(config: MessageFramerConfig) -> Self {
        Self {
            buffer: vec![0u8; config.max_length],
            filled: 0,
            synchronized: true,
            failed: false,
            config,
        }
    }

    pub fn config(&self) -> &MessageFramerConfig {
        &self.config
    }

    /// False after an overflow or format inconsistency, until resync succeeds.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Number of buffered bytes not yet part of a complete message.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Shift the unconsumed tail to the front of the buffer.
    fn compact(&mut self, consumed: usize) {
        if consumed == 0 {
            return;
        }
        let remaining = self.filled - consumed;
        buffer::move_within(&mut self.buffer, consumed as isize, 0, Some(remaining));
        self.filled = remaining;
    }

    fn overflow(&mut self) {
        warn!(
            capacity = self.buffer.len(),
            "message buffer overflow, discarding buffered bytes"
        );
        self.filled = 0;
        self.synchronized = false;
    }

    /// Try to regain alignment. Returns `Ok(false)` while more data is needed.
    fn resync(&mut self) -> Result<bool> {
        if let Some(terminator) = self.config.terminator.as_deref() {
            let term_len = terminator.len();
            let found =
                buffer::find_first_occurrence(&self.buffer[..self.filled], terminator, None, 0);
            return Ok(match found {
                Some(end) => {
                    debug!(discarded = end + 1, "resynchronized on terminator");
                    self.compact(end + 1);
                    self.synchronized = true;
                    true
                }
                None => {
                    self.compact(self.filled.saturating_sub(term_len - 1));
                    false
                }
            });
        }

        if let Some(synchronizer) = self.config.synchronizer.as_deref() {
            let sync_len = synchronizer.len();
            let header_len = self.config.header_len();
            let found = buffer::find_occurrences(
                &self.buffer[..self.filled],
                synchronizer,
                None,
                0,
                header_len,
            )
            .first()
            .copied();
            return Ok(match found {
                Some(end) => {
                    let start = end + 1 - sync_len - header_len;
                    debug!(discarded = start, "resynchronized on synchronizer pattern");
                    self.compact(start);
                    self.synchronized = true;
                    true
                }
                None => {
                    let keep = sync_len - 1 + header_len;
                    self.compact(self.filled.saturating_sub(keep));
                    false
                }
            });
        }

        Err(TransportError::Unsynchronizable)
    }

    /// Extract every complete message currently buffered.
    fn drain(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        loop {
            if !self.synchronized && !self.resync()? {
                return Ok(());
            }

            let consumed = if self.config.use_length_header {
                self.walk_headers(out)
            } else {
                self.split_on_terminators(out)
            };
            self.compact(consumed);

            if self.synchronized {
                return Ok(());
            }
        }
    }

    /// Walk consecutive length headers. Returns the number of consumed bytes.
    ///
    /// The header is authoritative: terminator bytes inside the header or the
    /// body are never taken as boundaries. When a terminator is configured it
    /// must sit at the declared end; if it does not, the first terminator after
    /// the header ends the message instead.
    fn walk_headers(&mut self, out: &mut Vec<Bytes>) -> usize {
        let capacity = self.buffer.len();
        let term_len = self.config.terminator_len();
        let mut pos = 0;

        while let Some(declared) = read_length_header(&self.buffer[pos..self.filled]) {
            if declared <= term_len || LENGTH_HEADER_SIZE + declared > capacity {
                warn!(declared, capacity, "length header out of range, resynchronizing");
                self.synchronized = false;
                return pos + 1;
            }

            let body_start = pos + LENGTH_HEADER_SIZE;
            let end = body_start + declared;
            if end > self.filled {
                break;
            }
            let body_end = end - term_len;

            match self.config.terminator.as_deref() {
                Some(terminator) if &self.buffer[body_end..end] != terminator => {
                    let found = buffer::find_first_occurrence(
                        &self.buffer[..self.filled],
                        terminator,
                        None,
                        body_start,
                    );
                    match found {
                        Some(term_end) => {
                            let actual = term_end + 1 - body_start;
                            warn!(declared, actual, "length header disagrees with terminator position");
                            let body = &self.buffer[body_start..term_end + 1 - term_len];
                            if !body.is_empty() {
                                out.push(Bytes::copy_from_slice(body));
                            }
                            pos = term_end + 1;
                        }
                        None => {
                            warn!(declared, "terminator missing at declared message end");
                            self.synchronized = false;
                            return pos + 1;
                        }
                    }
                }
                _ => {
                    out.push(Bytes::copy_from_slice(&self.buffer[body_start..body_end]));
                    pos = end;
                }
            }
        }
        pos
    }

    /// Split on terminator occurrences. Returns the number of consumed bytes.
    fn split_on_terminators(&mut self, out: &mut Vec<Bytes>) -> usize {
        let Some(terminator) = self.config.terminator.as_deref() else {
            return 0;
        };
        let data = &self.buffer[..self.filled];
        let ends = buffer::find_occurrences(data, terminator, None, 0, 0);
        let Some(&last) = ends.last() else {
            return 0;
        };

        // Intervals run from each message start to the first terminator byte.
        for (start, end) in buffer::get_intervals(&ends, 0, terminator.len() - 1) {
            let body = buffer::slice(data, start as isize, (end - start) as isize);
            if body.is_empty() {
                trace!(at = start, "skipping empty message");
                continue;
            }
            out.push(Bytes::copy_from_slice(body));
        }
        last + 1
    }
}

impl Framer for MessageFramer {
    fn process_received(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        if self.failed {
            return Err(TransportError::Unsynchronizable);
        }

        let mut messages = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            if self.filled == self.buffer.len() {
                self.overflow();
            }

            let copied = buffer::replace_with(&mut self.buffer, rest, 0, self.filled as isize, None);
            self.filled += copied;
            rest = &rest[copied..];
            trace!(bytes = copied, buffered = self.filled, "buffered chunk");

            if let Err(e) = self.drain(&mut messages) {
                self.failed = true;
                if messages.is_empty() {
                    return Err(e);
                }
                warn!(decoded = messages.len(), error = %e, "framing failed after decoding messages");
                break;
            }
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

    fn is_failed(&self) -> bool {
        self.failed
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.synchronized = true;
        self.failed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_only(max: usize) -> MessageFramerConfig {
        MessageFramerConfig::new(max, None, true).unwrap()
    }

    fn test_messages(count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let tag = i.wrapping_mul(2_654_435_761);
                format!("{:08x}-payload-{}", tag, "m".repeat(i % 40)).into_bytes()
            })
            .collect()
    }

    /// Feed `stream` in chunks whose sizes cycle through `sizes`.
    fn feed_chunked(framer: &mut MessageFramer, stream: &[u8], sizes: &[usize]) -> Vec<Bytes> {
        let mut received = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < stream.len() {
            let end = (offset + sizes[i % sizes.len()]).min(stream.len());
            received.extend(framer.process_received(&stream[offset..end]).unwrap());
            offset = end;
            i += 1;
        }
        received
    }

    fn encode_all(config: &MessageFramerConfig, messages: &[Vec<u8>]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| config.encode(m).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_header_only_three_byte_chunks() {
        let config = header_only(5000);
        let mut framer = MessageFramer::new(config.clone());
        let messages = vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()];
        let stream = encode_all(&config, &messages);

        let received = feed_chunked(&mut framer, &stream, &[3]);

        assert_eq!(received, messages);
        assert!(framer.is_empty());
    }

    #[test]
    fn test_round_trip_every_mode() {
        let configs = [
            header_only(5000),
            MessageFramerConfig::new(5000, Some(b"XXXXX"), true).unwrap(),
            MessageFramerConfig::new(5000, Some(b"XXXXX"), false).unwrap(),
        ];
        let messages = test_messages(200);

        for config in configs {
            let stream = encode_all(&config, &messages);
            let mut framer = MessageFramer::new(config);
            let received = feed_chunked(&mut framer, &stream, &[1, 7, 64, 13, 500, 3, 1024]);
            assert_eq!(received, messages);
            assert!(framer.is_synchronized());
        }
    }

    #[test]
    fn test_chunking_invariance() {
        let config = MessageFramerConfig::new(5000, Some(b"\r\n"), true).unwrap();
        let messages = test_messages(50);
        let stream = encode_all(&config, &messages);

        let mut whole = MessageFramer::new(config.clone());
        let at_once = whole.process_received(&stream).unwrap();

        let mut chunked = MessageFramer::new(config);
        let piecewise = feed_chunked(&mut chunked, &stream, &[5, 2, 11]);

        assert_eq!(at_once, piecewise);
        assert_eq!(at_once.len(), 50);
    }

    #[test]
    fn test_byte_at_a_time() {
        let config = MessageFramerConfig::new(100, Some(b"\n"), false).unwrap();
        let stream = encode_all(&config, &[b"hi".to_vec(), b"there".to_vec()]);
        let mut framer = MessageFramer::new(config);

        let received = feed_chunked(&mut framer, &stream, &[1]);

        assert_eq!(received, vec![b"hi".to_vec(), b"there".to_vec()]);
    }

    #[test]
    fn test_payload_containing_terminator_with_header() {
        let config = MessageFramerConfig::new(100, Some(&[0x03]), true).unwrap();
        let payload = vec![1, 0x03, 2, 0x03];
        let stream = config.encode(&payload).unwrap();
        let mut framer = MessageFramer::new(config);

        assert_eq!(framer.process_received(&stream).unwrap(), vec![payload]);
    }

    #[test]
    fn test_terminator_byte_inside_header() {
        let config = MessageFramerConfig::new(5000, Some(&[3]), true).unwrap();
        let mut framer = MessageFramer::new(config);

        let received = framer
            .process_received(&[0, 3, 88, 88, 88, 3, 0, 3, 99, 99, 99, 3])
            .unwrap();

        assert_eq!(received, vec![vec![88u8, 88, 88], vec![99u8, 99, 99]]);
    }

    #[test]
    fn test_header_terminator_mismatch_terminator_wins() {
        let config = MessageFramerConfig::new(100, Some(&[3]), true).unwrap();
        let mut framer = MessageFramer::new(config);

        let received = framer
            .process_received(&[0, 6, b'a', b'b', 3, b'c', b'd', b'e'])
            .unwrap();

        assert_eq!(received, vec![b"ab".to_vec()]);
    }

    #[test]
    fn test_empty_chunk() {
        let mut framer = MessageFramer::new(header_only(5000));
        assert!(framer.process_received(&[]).unwrap().is_empty());
        assert!(framer.is_empty());
    }

    #[test]
    fn test_partial_message_is_kept() {
        let config = header_only(5000);
        let wire = config.encode(b"complete").unwrap();
        let mut framer = MessageFramer::new(config);

        let mut stream = wire.to_vec();
        stream.extend_from_slice(&[0, 10, b'p', b'a']);
        let received = framer.process_received(&stream).unwrap();

        assert_eq!(received, vec![b"complete".to_vec()]);
        assert_eq!(framer.len(), 4);
    }

    #[test]
    fn test_resync_with_synchronizer() {
        let max = 5000;
        let config = header_only(max).with_synchronizer(b"!!!!");
        let packet = config.encode(b"!!!!THIS IS MY MESSAGE!").unwrap();

        let mut stream = vec![0u8; max + 300];
        stream[0] = 100;
        let at = max + 150;
        stream[at..at + packet.len()].copy_from_slice(&packet);

        let mut framer = MessageFramer::new(config);
        let received = feed_chunked(&mut framer, &stream, &[100]);

        assert_eq!(received, vec![b"!!!!THIS IS MY MESSAGE!".to_vec()]);
    }

    #[test]
    fn test_resync_with_terminator() {
        let max = 5000;
        let config = MessageFramerConfig::new(max, Some(b"XXXXXXX"), true).unwrap();
        let body = vec![b'M'; 23];
        let packet = config.encode(&body).unwrap();

        let mut stream = vec![0u8; max + 300];
        stream[0] = 100;
        let at = max + 150;
        stream[at..at + packet.len()].copy_from_slice(&packet);
        stream[at + packet.len()..at + 2 * packet.len()].copy_from_slice(&packet);

        let mut framer = MessageFramer::new(config);
        let received = feed_chunked(&mut framer, &stream, &[100]);

        // The first copy is consumed while regaining alignment.
        assert_eq!(received, vec![body]);
    }

    #[test]
    fn test_overflow_then_terminator_resync() {
        let config = MessageFramerConfig::new(16, Some(b"\n"), false).unwrap();
        let mut framer = MessageFramer::new(config);

        let garbage = [b'g'; 20];
        assert!(framer.process_received(&garbage).unwrap().is_empty());
        assert!(!framer.is_synchronized());

        let received = framer.process_received(b"tail\nhello\n").unwrap();
        assert_eq!(received, vec![b"hello".to_vec()]);
        assert!(framer.is_synchronized());
        assert!(framer.is_empty());
    }

    #[test]
    fn test_unsynchronizable_without_pattern() {
        let mut framer = MessageFramer::new(header_only(100));

        let result = framer.process_received(&[0xFF, 0xFF, 1, 2, 3]);

        assert!(matches!(result, Err(TransportError::Unsynchronizable)));
    }

    #[test]
    fn test_messages_before_fatal_header_are_returned() {
        let config = header_only(100);
        let mut stream = config.encode(b"ok").unwrap().to_vec();
        stream.extend_from_slice(&[0, 0]);
        let mut framer = MessageFramer::new(config);

        let received = framer.process_received(&stream).unwrap();

        assert_eq!(received, vec![b"ok".to_vec()]);
        assert!(framer.is_failed());
        assert!(matches!(
            framer.process_received(b"more"),
            Err(TransportError::Unsynchronizable)
        ));

        framer.reset();
        assert!(!framer.is_failed());
    }

    #[test]
    fn test_repeated_terminators_do_not_yield_empty_messages() {
        let config = MessageFramerConfig::new(100, Some(b"\n"), false).unwrap();
        let mut framer = MessageFramer::new(config);

        let received = framer.process_received(b"\n\nabc\n\n").unwrap();

        assert_eq!(received, vec![b"abc".to_vec()]);
        assert!(framer.is_empty());
    }

    #[test]
    fn test_reset_clears_state() {
        let config = MessageFramerConfig::new(16, Some(b"\n"), false).unwrap();
        let mut framer = MessageFramer::new(config);
        framer.process_received(&[b'g'; 20]).unwrap();
        assert!(!framer.is_synchronized());

        framer.reset();

        assert!(framer.is_synchronized());
        assert!(framer.is_empty());
        assert_eq!(
            framer.process_received(b"ok\n").unwrap(),
            vec![b"ok".to_vec()]
        );
    }

    #[test]
    fn test_config_requires_boundary() {
        assert!(matches!(
            MessageFramerConfig::new(5000, None, false),
            Err(TransportError::InvalidConfig(_))
        ));
        assert!(MessageFramerConfig::new(5000, Some(b""), false).is_err());
    }

    #[test]
    fn test_config_requires_room_for_payload() {
        assert!(MessageFramerConfig::new(3, Some(b"X"), true).is_err());
        assert!(MessageFramerConfig::new(4, Some(b"X"), true).is_ok());
    }

    #[test]
    fn test_encode_layout() {
        let config = MessageFramerConfig::new(100, Some(b"XX"), true).unwrap();
        let wire = config.encode(b"abc").unwrap();
        assert_eq!(&wire[..], &[0, 5, b'a', b'b', b'c', b'X', b'X']);
    }

    #[test]
    fn test_encode_rejects_oversized_and_empty() {
        let config = header_only(10);
        assert!(matches!(
            config.encode(&[1u8; 9]),
            Err(TransportError::PayloadTooLarge { size: 11, max: 10 })
        ));
        assert!(config.encode(&[1u8; 8]).is_ok());
        assert!(matches!(config.encode(b""), Err(TransportError::EmptyPayload)));
    }
}
