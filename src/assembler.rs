//! Per-connection reassembly of packets from arbitrarily split byte chunks.
//!
//! TCP delivers an ordered byte stream with no regard for packet boundaries: a
//! read may carry part of a packet, exactly one, several, or the tail of one
//! and the head of the next. [`StreamAssembler`] keeps at most one pending
//! fragment per [`ConnectionKey`] and turns each chunk into the sequence of
//! packets it completes.
//!
//! Connections without a key (their socket never exposed a peer address) are
//! served best effort: packets wholly contained in one chunk are still
//! emitted, but a packet split across chunks is lost because there is nowhere
//! to park its first half.
//!
//! Fragments are never expired by the assembler. Callers that need to bound
//! memory held by silent peers run [`StreamAssembler::purge_idle_at`] from
//! their own sweep task.

use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use crate::{
    packet::{self, Packet, PacketSize},
    varint::VarIntError,
};

/// Identity of a connection for fragment tracking, formatted as `address:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    /// Build a key from an explicit string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }

    /// Derive a key from a peer address, if the socket exposed one.
    #[must_use]
    pub fn from_peer(peer: Option<SocketAddr>) -> Option<Self> {
        peer.map(|addr| Self(format!("{}:{}", addr.ip(), addr.port())))
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug)]
struct Fragment {
    buffer: BytesMut,
    updated_at: Instant,
}

/// State of the length prefix at the head of the accumulation buffer.
#[derive(Clone, Copy)]
enum Prefix {
    /// Not enough bytes to decode the prefix yet.
    Pending,
    /// Prefix decoded; the packet is `total` bytes long, if non-negative.
    Known(PacketSize),
    /// Prefix can never decode; the buffer can never complete.
    Malformed,
}

impl Prefix {
    fn of(buffer: &[u8]) -> Self {
        match PacketSize::decode(buffer) {
            Ok(size) => Self::Known(size),
            Err(VarIntError::Underflow { .. }) => Self::Pending,
            Err(e) => {
                log::trace!("unframeable prefix: error={e}");
                Self::Malformed
            }
        }
    }

    fn size(self) -> Option<PacketSize> {
        match self {
            Self::Known(size) => Some(size),
            Self::Pending | Self::Malformed => None,
        }
    }

    /// How many bytes to append before the next completeness check.
    fn step(self, buffered: usize, available: usize) -> usize {
        let wanted = match self {
            // The prefix is re-read after every byte until it decodes.
            Self::Pending => 1,
            Self::Known(size) => size
                .total_length()
                .and_then(|total| total.checked_sub(buffered))
                .filter(|&missing| missing > 0)
                .unwrap_or(available),
            Self::Malformed => available,
        };
        wanted.min(available)
    }
}

/// Pending-fragment map and the chunk scanning algorithm.
///
/// The map is sharded, so distinct connections may assemble concurrently.
/// Chunks for the same key must be fed sequentially, in arrival order.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    fragments: DashMap<ConnectionKey, Fragment>,
}

impl StreamAssembler {
    /// Create an assembler with no pending fragments.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Feed one received chunk and return the packets it completes, in order.
    pub fn assemble(&self, key: Option<&ConnectionKey>, chunk: Bytes) -> Vec<Packet> {
        self.assemble_at(key, chunk, Instant::now())
    }

    /// Feed one chunk using an explicit clock reading for the fragment timestamp.
    pub fn assemble_at(
        &self,
        key: Option<&ConnectionKey>,
        chunk: Bytes,
        now: Instant,
    ) -> Vec<Packet> {
        let pending = key
            .and_then(|key| self.fragments.remove(key))
            .map(|(_, fragment)| fragment.buffer);

        if pending.is_none() && packet::is_complete(&chunk) {
            return vec![Packet::from(chunk)];
        }

        let mut buffer = pending.unwrap_or_default();
        let mut prefix = Prefix::of(&buffer);
        let mut packets = Vec::new();
        let mut rest = &chunk[..];

        while !rest.is_empty() {
            let take = prefix.step(buffer.len(), rest.len());
            let (head, tail) = rest.split_at(take);
            buffer.extend_from_slice(head);
            rest = tail;

            if matches!(prefix, Prefix::Pending) {
                prefix = Prefix::of(&buffer);
            }
            if packet::is_complete_with(&buffer, prefix.size()) {
                packets.push(Packet::from(buffer.split().freeze()));
                prefix = Prefix::Pending;
            }
        }

        if !buffer.is_empty() {
            self.store(key, buffer, now);
        }
        packets
    }

    fn store(&self, key: Option<&ConnectionKey>, buffer: BytesMut, now: Instant) {
        match key {
            Some(key) => {
                log::trace!("buffering fragment: key={key}, bytes={}", buffer.len());
                self.fragments.insert(
                    key.clone(),
                    Fragment {
                        buffer,
                        updated_at: now,
                    },
                );
            }
            None => log::trace!(
                "dropping partial packet from unidentified connection: bytes={}",
                buffer.len()
            ),
        }
    }

    /// Copy of the fragment currently buffered for `key`.
    #[must_use]
    pub fn pending(&self, key: &ConnectionKey) -> Option<Bytes> {
        self.fragments
            .get(key)
            .map(|fragment| Bytes::copy_from_slice(&fragment.buffer))
    }

    /// Drop the fragment for `key`, returning the discarded bytes.
    pub fn discard(&self, key: &ConnectionKey) -> Option<Bytes> {
        self.fragments
            .remove(key)
            .map(|(_, fragment)| fragment.buffer.freeze())
    }

    /// Number of connections with a fragment outstanding.
    #[must_use]
    pub fn pending_count(&self) -> usize { self.fragments.len() }

    /// Drop fragments that received no data for at least `max_idle`.
    ///
    /// Returns the keys whose fragments were evicted.
    pub fn purge_idle_at(&self, now: Instant, max_idle: Duration) -> Vec<ConnectionKey> {
        let mut evicted = Vec::new();
        self.fragments.retain(|key, fragment| {
            let idle = now.saturating_duration_since(fragment.updated_at) >= max_idle;
            if idle {
                evicted.push(key.clone());
            }
            !idle
        });
        evicted
    }
}
