//! Variable-length integer codec used for every packet length prefix.
//!
//! A VarInt carries a signed 32-bit value in one to five bytes. Each byte holds
//! seven payload bits, least-significant group first, and sets the high bit
//! when another byte follows. Negative values are encoded from their
//! two's-complement bit pattern and therefore always occupy five bytes.

use bytes::BufMut;
use thiserror::Error;

/// Maximum number of bytes a VarInt may occupy on the wire.
pub const MAX_VARINT_LEN: usize = 5;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Errors raised while encoding or decoding VarInts.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VarIntError {
    /// The value does not fit in a signed 32-bit integer.
    #[error("value {value} is outside the VarInt range [-2^31, 2^31 - 1]")]
    OutOfRange {
        /// Rejected value.
        value: i64,
    },
    /// Input ended before a byte with the continuation bit clear was read.
    #[error("VarInt underflow: {available} bytes available, decoding from offset {offset}")]
    Underflow {
        /// Offset the decode started from.
        offset: usize,
        /// Total length of the input.
        available: usize,
    },
    /// Five bytes were read and the last still requested a continuation.
    #[error("VarInt starting at offset {offset} exceeds {MAX_VARINT_LEN} bytes")]
    TooLong {
        /// Offset the decode started from.
        offset: usize,
    },
}

impl VarIntError {
    /// Whether this error only means "not enough bytes yet".
    ///
    /// Stream assembly treats underflow as recoverable: more data may still
    /// arrive to complete the prefix.
    #[must_use]
    pub const fn is_underflow(&self) -> bool { matches!(self, Self::Underflow { .. }) }
}

/// Encode `value` as a VarInt.
///
/// The input is widened to `i64` so callers can hand over values of unknown
/// provenance; anything outside the `i32` range is rejected without producing
/// output.
///
/// # Examples
///
/// ```
/// use arciera::varint::encode;
///
/// assert_eq!(encode(0).unwrap(), [0x00]);
/// assert_eq!(encode(128).unwrap(), [0x80, 0x01]);
/// assert!(encode(1 << 31).is_err());
/// ```
///
/// # Errors
///
/// Returns [`VarIntError::OutOfRange`] if `value` does not fit in an `i32`.
pub fn encode(value: i64) -> Result<Vec<u8>, VarIntError> {
    let value = i32::try_from(value).map_err(|_| VarIntError::OutOfRange { value })?;
    let mut out = Vec::with_capacity(encoded_len(value));
    encode_into(value, &mut out);
    Ok(out)
}

/// Append the VarInt encoding of `value` to `dst`.
pub fn encode_into<B: BufMut>(value: i32, dst: &mut B) {
    // Shift the bit pattern, not the signed value, so negatives terminate.
    #[expect(clippy::cast_sign_loss, reason = "reinterpreting the two's-complement bits")]
    let mut remaining = value as u32;
    loop {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "only the low seven bits are kept"
        )]
        let byte = (remaining as u8) & SEGMENT_BITS;
        remaining >>= 7;
        if remaining == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | CONTINUE_BIT);
    }
}

/// Number of bytes [`encode_into`] writes for `value`.
#[must_use]
#[expect(clippy::cast_sign_loss, reason = "reinterpreting the two's-complement bits")]
pub const fn encoded_len(value: i32) -> usize {
    let bits = u32::BITS - (value as u32).leading_zeros();
    if bits == 0 { 1 } else { bits.div_ceil(7) as usize }
}

/// Decode a VarInt from `bytes` starting at `offset`.
///
/// Returns the decoded value together with the number of bytes consumed.
///
/// # Examples
///
/// ```
/// use arciera::varint::{VarIntError, decode};
///
/// assert_eq!(decode(&[0xAA, 0x80, 0x01], 1), Ok((128, 2)));
/// assert_eq!(
///     decode(&[0x80], 0),
///     Err(VarIntError::Underflow { offset: 0, available: 1 })
/// );
/// ```
///
/// # Errors
///
/// Returns [`VarIntError::Underflow`] when the input runs out before the final
/// byte, and [`VarIntError::TooLong`] when the fifth byte still has its
/// continuation bit set.
pub fn decode(bytes: &[u8], offset: usize) -> Result<(i32, usize), VarIntError> {
    let underflow = VarIntError::Underflow {
        offset,
        available: bytes.len(),
    };
    let tail = bytes.get(offset..).ok_or(underflow)?;

    let mut result: u32 = 0;
    let mut shift: u32 = 0;
    for (index, &byte) in tail.iter().take(MAX_VARINT_LEN).enumerate() {
        // Bits shifted beyond the 32-bit width of the fifth group are discarded.
        result |= u32::from(byte & SEGMENT_BITS) << shift;
        shift += 7;
        if byte & CONTINUE_BIT == 0 {
            #[expect(clippy::cast_possible_wrap, reason = "two's-complement accumulation")]
            let value = result as i32;
            return Ok((value, index + 1));
        }
    }

    if tail.len() >= MAX_VARINT_LEN {
        Err(VarIntError::TooLong { offset })
    } else {
        Err(underflow)
    }
}
