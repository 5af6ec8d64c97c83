//! Connections and connection-scoped event dispatch.
//!
//! A [`Connection`] is a cheap handle shared by the socket task, the server's
//! registry and any event referring to it. It owns its own
//! [`EventBus`]; [`Connection::publish`] first drains that bus and then
//! bubbles the same event instance to the server bus.
//!
//! Outbound bytes are queued with [`Connection::send`] and written by
//! whichever task holds the matching [`ConnectionIo`].

use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    assembler::ConnectionKey,
    bus::{DispatchError, EventBus},
    event::Event,
    packet::Packet,
    server::Server,
};

/// Identifier assigned to a connection, unique within a [`Server`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub const fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Errors raised when using a connection handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection was closed; no further bytes can be queued.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

struct ConnectionInner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    key: Option<ConnectionKey>,
    server: Server,
    events: EventBus,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

/// Shared handle to an open connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Transport half of a connection: outbound queue and close signal.
///
/// Returned by [`Connection::open`] to the task that owns the socket.
#[derive(Debug)]
pub struct ConnectionIo {
    outbound: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
}

impl ConnectionIo {
    /// Next queued outbound chunk, in send order.
    pub async fn next_outbound(&mut self) -> Option<Bytes> { self.outbound.recv().await }

    /// Take a queued outbound chunk without waiting.
    pub fn try_next_outbound(&mut self) -> Option<Bytes> { self.outbound.try_recv().ok() }

    /// Resolves once [`Connection::close`] has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> { self.closed.cancelled() }

    /// Token cancelled by [`Connection::close`], for use in `select!` loops.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken { self.closed.clone() }
}

impl Connection {
    /// Open a connection on `server` and add it to the server's registry.
    ///
    /// `peer_addr` is the remote address reported by the socket, if any; it
    /// determines the [`ConnectionKey`] used for fragment tracking.
    #[must_use]
    pub fn open(server: &Server, peer_addr: Option<SocketAddr>) -> (Self, ConnectionIo) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: server.next_connection_id(),
                peer_addr,
                key: ConnectionKey::from_peer(peer_addr),
                server: server.clone(),
                events: EventBus::new(),
                outbound: tx,
                closed: closed.clone(),
            }),
        };
        server.track(&connection);
        let io = ConnectionIo {
            outbound: rx,
            closed,
        };
        (connection, io)
    }

    /// Identifier of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.inner.id }

    /// Remote address, if the socket exposed one.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.inner.peer_addr }

    /// Fragment-tracking identity; `None` when no peer address is known.
    #[must_use]
    pub fn key(&self) -> Option<&ConnectionKey> { self.inner.key.as_ref() }

    /// Server this connection belongs to.
    #[must_use]
    pub fn server(&self) -> &Server { &self.inner.server }

    /// Connection-level event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus { &self.inner.events }

    /// Publish on this connection's bus, then bubble to the server bus.
    ///
    /// The server bus receives the same instance, so a cancellation made by a
    /// connection-level listener suppresses every server-level listener.
    ///
    /// # Errors
    ///
    /// Returns the first [`DispatchError`] raised by either bus; a failure at
    /// connection level prevents bubbling.
    pub fn publish(&self, event: &Event) -> Result<(), DispatchError> {
        self.inner.events.publish(event)?;
        self.inner.server.events().publish(event)
    }

    /// Queue raw bytes for writing to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] once the connection is closed or its
    /// transport task has finished.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.id()));
        }
        self.inner
            .outbound
            .send(bytes.into())
            .map_err(|_| ConnectionError::Closed(self.id()))
    }

    /// Queue a framed packet for writing to the peer.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.send(packet.clone().into_bytes())
    }

    /// Ask the transport task to close the socket.
    pub fn close(&self) { self.inner.closed.cancel(); }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.closed.is_cancelled() }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
