//! Length-prefixed packets and the completeness predicate used for framing.
//!
//! On the wire every packet is `VarInt(length) || payload`, where `length`
//! counts only the payload bytes. [`Packet`] wraps the full byte sequence,
//! prefix included, and derives its size from the prefix on demand.

use bytes::{Bytes, BytesMut};

use crate::varint::{self, VarIntError};

/// Length information decoded from a packet's VarInt prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketSize {
    /// Payload length announced by the prefix.
    pub declared_length: i32,
    /// Number of bytes occupied by the prefix itself.
    pub prefix_length: usize,
}

impl PacketSize {
    /// Decode the size prefix at the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Propagates any [`VarIntError`] from the prefix decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, VarIntError> {
        let (declared_length, prefix_length) = varint::decode(bytes, 0)?;
        Ok(Self {
            declared_length,
            prefix_length,
        })
    }

    /// Total byte length of a packet with this size, prefix included.
    ///
    /// Returns `None` for negative declared lengths, which no buffer can match.
    #[must_use]
    pub fn total_length(&self) -> Option<usize> {
        usize::try_from(self.declared_length)
            .ok()
            .and_then(|len| len.checked_add(self.prefix_length))
    }

    /// Whether a buffer of `buffer_len` bytes holds exactly one packet of this size.
    #[must_use]
    pub fn matches(&self, buffer_len: usize) -> bool {
        buffer_len
            .checked_sub(self.prefix_length)
            .and_then(|payload| i32::try_from(payload).ok())
            == Some(self.declared_length)
    }
}

/// Attempt to decode the size prefix of `bytes`.
///
/// Decode failures of any kind are reported as "unknown" (`None`); this never
/// fails. Underflow is the expected outcome while a prefix is still arriving.
#[must_use]
pub fn size_of(bytes: &[u8]) -> Option<PacketSize> {
    match PacketSize::decode(bytes) {
        Ok(size) => Some(size),
        Err(e) => {
            if !e.is_underflow() {
                log::trace!("malformed packet prefix: error={e}");
            }
            None
        }
    }
}

/// Whether `bytes` is exactly one complete packet.
///
/// Strict equality: a buffer carrying bytes beyond the declared payload is
/// not complete and must be re-split by the caller.
///
/// # Examples
///
/// ```
/// use arciera::packet::is_complete;
///
/// assert!(is_complete(&[0x02, 0xAA, 0xBB]));
/// assert!(!is_complete(&[0x02, 0xAA]));
/// assert!(!is_complete(&[0x02, 0xAA, 0xBB, 0xCC]));
/// ```
#[must_use]
pub fn is_complete(bytes: &[u8]) -> bool { is_complete_with(bytes, size_of(bytes)) }

/// Completeness check reusing a size the caller already decoded.
///
/// `None` means the size is unknown and yields `false`.
#[must_use]
pub fn is_complete_with(bytes: &[u8], size: Option<PacketSize>) -> bool {
    size.is_some_and(|size| size.matches(bytes.len()))
}

/// A protocol packet: VarInt length prefix followed by its payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    bytes: Bytes,
}

impl Packet {
    /// Wrap raw packet bytes, prefix included.
    ///
    /// No validation is performed; use [`Packet::is_complete`] to check framing.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Frame `payload` by prepending its VarInt length.
    ///
    /// # Errors
    ///
    /// Returns [`VarIntError::OutOfRange`] if the payload is longer than
    /// `i32::MAX` bytes.
    pub fn from_payload(payload: &[u8]) -> Result<Self, VarIntError> {
        let len = i64::try_from(payload.len()).unwrap_or(i64::MAX);
        let len = i32::try_from(len).map_err(|_| VarIntError::OutOfRange { value: len })?;
        let mut buf = BytesMut::with_capacity(varint::encoded_len(len) + payload.len());
        varint::encode_into(len, &mut buf);
        buf.extend_from_slice(payload);
        Ok(Self { bytes: buf.freeze() })
    }

    /// Full packet bytes, prefix included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] { &self.bytes }

    /// Consume the packet, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes { self.bytes }

    /// Total number of bytes held, prefix included.
    #[must_use]
    pub fn len(&self) -> usize { self.bytes.len() }

    /// Whether no bytes are held at all.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    /// Decoded size prefix, or `None` when it cannot be decoded.
    #[must_use]
    pub fn size(&self) -> Option<PacketSize> { size_of(&self.bytes) }

    /// Whether the held bytes form exactly one complete packet.
    #[must_use]
    pub fn is_complete(&self) -> bool { is_complete(&self.bytes) }

    /// Completeness check with a size decoded earlier.
    #[must_use]
    pub fn is_complete_with(&self, size: Option<PacketSize>) -> bool {
        is_complete_with(&self.bytes, size)
    }

    /// Payload bytes following the prefix, if the packet is complete.
    #[must_use]
    pub fn payload(&self) -> Option<Bytes> {
        let size = self.size()?;
        size.matches(self.bytes.len())
            .then(|| self.bytes.slice(size.prefix_length..))
    }
}

impl From<Bytes> for Packet {
    fn from(bytes: Bytes) -> Self { Self { bytes } }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] { &self.bytes }
}
