//! Wire-level constants and fixed-width length headers.
//!
//! Two layouts are supported:
//! ```text
//! Message framer:  ┌──────────────┬─────────┬────────────┐
//!                  │ Length (opt) │ Payload │ Terminator │
//!                  │ 2 bytes BE   │         │ (opt)      │
//!                  └──────────────┴─────────┴────────────┘
//!
//! Simple framer:   ┌────────┬────────────┬─────────┐
//!                  │ Marker │ Length     │ Payload │
//!                  │ 0x00   │ 1-3 bytes  │         │
//!                  └────────┴────────────┴─────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, TransportError};

/// Width of the optional message-framer length header.
pub const LENGTH_HEADER_SIZE: usize = 2;

/// Start-of-message marker used by the simple framer.
pub const START_MARKER: u8 = 0x00;

/// Smallest supported simple-framer length header.
pub const MIN_SIMPLE_HEADER_WIDTH: usize = 1;

/// Largest supported simple-framer length header.
pub const MAX_SIMPLE_HEADER_WIDTH: usize = 3;

/// Largest value a big-endian header of `width` bytes can carry.
pub fn max_length_for_width(width: usize) -> usize {
    if width >= std::mem::size_of::<usize>() {
        return usize::MAX;
    }
    (1usize << (8 * width)) - 1
}

/// Encode `length` as a big-endian header of exactly `width` bytes.
///
/// # Example
///
/// ```
/// use layer4_stack::framing::wire::length_to_header;
///
/// assert_eq!(length_to_header(255, 1).unwrap(), vec![255]);
/// assert_eq!(length_to_header(258, 4).unwrap(), vec![0, 0, 1, 2]);
/// ```
pub fn length_to_header(length: usize, width: usize) -> Result<Vec<u8>> {
    if width == 0 || length > max_length_for_width(width) {
        return Err(TransportError::HeaderOverflow { length, width });
    }

    let mut header = vec![0u8; width];
    let mut rest = length;
    for slot in header.iter_mut().rev() {
        *slot = (rest & 0xFF) as u8;
        rest >>= 8;
        if rest == 0 {
            break;
        }
    }
    Ok(header)
}

/// Decode a big-endian length header of any width up to the platform word.
pub fn header_to_length(header: &[u8]) -> Result<usize> {
    if header.len() > std::mem::size_of::<usize>() {
        return Err(TransportError::HeaderTooWide(header.len()));
    }
    Ok(header
        .iter()
        .fold(0usize, |acc, &byte| (acc << 8) | byte as usize))
}

/// Decode the two-byte message-framer length header at the front of `buf`.
#[inline]
pub(crate) fn read_length_header(buf: &[u8]) -> Option<usize> {
    let bytes: [u8; LENGTH_HEADER_SIZE] = buf.get(..LENGTH_HEADER_SIZE)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes) as usize)
}
