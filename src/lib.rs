#![doc(html_root_url = "https://docs.rs/arciera/latest")]
//! Public API for the `arciera` library.
//!
//! Arciera is an event-driven TCP server core for length-prefixed binary
//! protocols. Socket reads are published as events; a built-in listener
//! reassembles VarInt-framed packets per connection and republishes them, and
//! applications react by registering prioritised, cancellable listeners on
//! connection or server [`EventBus`](bus::EventBus)es.

pub mod assembler;
pub mod bus;
pub mod connection;
pub mod event;
pub mod metrics;
pub mod packet;
pub mod panic;
pub mod plugin;
pub mod server;
pub mod varint;

pub use assembler::{ConnectionKey, StreamAssembler};
pub use bus::{
    DEFAULT_PRIORITY,
    DispatchError,
    EventBus,
    Listener,
    ListenerError,
    ListenerId,
    ListenerResult,
    Priority,
};
pub use connection::{Connection, ConnectionError, ConnectionId};
pub use event::{Event, EventKind, EventPayload};
pub use packet::{Packet, PacketSize};
pub use plugin::{Plugin, PluginError, PluginManager};
pub use server::{ArcieraServer, Server, ServerError};
pub use varint::VarIntError;
