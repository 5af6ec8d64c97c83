//! Events distributed through [`EventBus`](crate::bus::EventBus) instances.
//!
//! The set of events is closed: each [`EventKind`] has exactly one
//! [`EventPayload`] variant, and listeners are registered per kind. An
//! [`Event`] is a cheap handle; clones refer to the same instance and share
//! its cancellation flag, which is how a cancellation made by a
//! connection-level listener is seen by the server-level dispatch that
//! follows it.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;

use crate::{connection::Connection, packet::Packet, server::Server};

/// Dispatch key for events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The server is bound and accepting connections.
    ServerListening,
    /// A TCP connection was accepted.
    Connected,
    /// Raw bytes arrived on a connection; they may hold any part of a packet.
    IncomingData,
    /// A complete packet was assembled from a connection's byte stream.
    PacketReceived,
    /// The connection's byte stream ended.
    ConnectionEnd,
}

impl EventKind {
    /// Every kind, in lifecycle order.
    pub const ALL: [EventKind; 5] = [
        EventKind::ServerListening,
        EventKind::Connected,
        EventKind::IncomingData,
        EventKind::PacketReceived,
        EventKind::ConnectionEnd,
    ];

    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::ServerListening => "server_listening",
            EventKind::Connected => "connected",
            EventKind::IncomingData => "incoming_data",
            EventKind::PacketReceived => "packet_received",
            EventKind::ConnectionEnd => "connection_end",
        }
    }

    /// Whether events of this kind originate from a connection.
    #[must_use]
    pub const fn is_connection_scoped(self) -> bool {
        !matches!(self, EventKind::ServerListening)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Data carried by an event.
#[derive(Clone, Debug)]
pub enum EventPayload {
    /// See [`EventKind::ServerListening`].
    ServerListening {
        /// Address the listener is bound to, if it could be read.
        local_addr: Option<SocketAddr>,
    },
    /// See [`EventKind::Connected`].
    Connected {
        /// Newly accepted connection.
        connection: Connection,
    },
    /// See [`EventKind::IncomingData`].
    IncomingData {
        /// Connection the bytes were read from.
        connection: Connection,
        /// Bytes exactly as delivered by one socket read.
        data: Bytes,
    },
    /// See [`EventKind::PacketReceived`].
    PacketReceived {
        /// Connection the packet was assembled for.
        connection: Connection,
        /// Complete packet, prefix included.
        packet: Packet,
    },
    /// See [`EventKind::ConnectionEnd`].
    ConnectionEnd {
        /// Connection that ended.
        connection: Connection,
    },
}

impl EventPayload {
    /// Kind this payload is dispatched under.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            EventPayload::ServerListening { .. } => EventKind::ServerListening,
            EventPayload::Connected { .. } => EventKind::Connected,
            EventPayload::IncomingData { .. } => EventKind::IncomingData,
            EventPayload::PacketReceived { .. } => EventKind::PacketReceived,
            EventPayload::ConnectionEnd { .. } => EventKind::ConnectionEnd,
        }
    }

    /// Connection the payload refers to, for connection-scoped kinds.
    #[must_use]
    pub const fn connection(&self) -> Option<&Connection> {
        match self {
            EventPayload::ServerListening { .. } => None,
            EventPayload::Connected { connection }
            | EventPayload::IncomingData { connection, .. }
            | EventPayload::PacketReceived { connection, .. }
            | EventPayload::ConnectionEnd { connection } => Some(connection),
        }
    }
}

struct EventInner {
    server: Server,
    payload: EventPayload,
    cancelled: AtomicBool,
}

/// A cancellable, one-shot event.
///
/// Cancellation is one-way: once [`cancel`](Self::cancel) is called the flag
/// stays set for this instance and every clone of it.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Create an event raised on `server`.
    #[must_use]
    pub fn new(server: Server, payload: EventPayload) -> Self {
        Self {
            inner: Arc::new(EventInner {
                server,
                payload,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Build a [`EventKind::ServerListening`] event.
    #[must_use]
    pub fn server_listening(server: &Server, local_addr: Option<SocketAddr>) -> Self {
        Self::new(server.clone(), EventPayload::ServerListening { local_addr })
    }

    /// Build a [`EventKind::Connected`] event.
    #[must_use]
    pub fn connected(connection: &Connection) -> Self {
        Self::new(
            connection.server().clone(),
            EventPayload::Connected {
                connection: connection.clone(),
            },
        )
    }

    /// Build an [`EventKind::IncomingData`] event.
    #[must_use]
    pub fn incoming_data(connection: &Connection, data: Bytes) -> Self {
        Self::new(
            connection.server().clone(),
            EventPayload::IncomingData {
                connection: connection.clone(),
                data,
            },
        )
    }

    /// Build a [`EventKind::PacketReceived`] event.
    #[must_use]
    pub fn packet_received(connection: &Connection, packet: Packet) -> Self {
        Self::new(
            connection.server().clone(),
            EventPayload::PacketReceived {
                connection: connection.clone(),
                packet,
            },
        )
    }

    /// Build an [`EventKind::ConnectionEnd`] event.
    #[must_use]
    pub fn connection_end(connection: &Connection) -> Self {
        Self::new(
            connection.server().clone(),
            EventPayload::ConnectionEnd {
                connection: connection.clone(),
            },
        )
    }

    /// Kind used to select listeners.
    #[must_use]
    pub fn kind(&self) -> EventKind { self.inner.payload.kind() }

    /// Server the event was raised on.
    #[must_use]
    pub fn server(&self) -> &Server { &self.inner.server }

    /// Event data.
    #[must_use]
    pub fn payload(&self) -> &EventPayload { &self.inner.payload }

    /// Originating connection, for connection-scoped events.
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> { self.inner.payload.connection() }

    /// Raw bytes of an [`EventKind::IncomingData`] event.
    #[must_use]
    pub fn data(&self) -> Option<&Bytes> {
        match &self.inner.payload {
            EventPayload::IncomingData { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Packet of an [`EventKind::PacketReceived`] event.
    #[must_use]
    pub fn packet(&self) -> Option<&Packet> {
        match &self.inner.payload {
            EventPayload::PacketReceived { packet, .. } => Some(packet),
            _ => None,
        }
    }

    /// Stop delivery of this event to any listener not yet invoked.
    pub fn cancel(&self) { self.inner.cancelled.store(true, Ordering::Release); }

    /// Whether [`cancel`](Self::cancel) has been called on this instance.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.inner.cancelled.load(Ordering::Acquire) }

    /// Whether `self` and `other` are the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Event) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind())
            .field("connection", &self.connection().map(Connection::id))
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
