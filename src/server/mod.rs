//! Server state and the Tokio runner that feeds it.
//!
//! [`Server`] is the shared core: the server-level [`EventBus`], the
//! [`StreamAssembler`] holding every connection's partial packet, the plugin
//! registry and the table of open connections. It is cheap to clone and does
//! no I/O itself, which keeps it usable from unit tests without sockets.
//!
//! [`ArcieraServer`] binds a TCP listener and drives a [`Server`]: it spawns
//! accept workers, one task per connection, and publishes connection
//! lifecycle events on the buses.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    assembler::StreamAssembler,
    bus::{DispatchError, EventBus, Listener, ListenerError, ListenerResult, Priority},
    connection::{Connection, ConnectionId},
    event::{Event, EventKind},
    plugin::{Plugin, PluginError, PluginManager},
};

/// Priority of the built-in `IncomingData` listener that assembles packets.
///
/// Server-level listeners registered above this value observe raw chunks
/// before assembly and may cancel them.
pub const ASSEMBLER_PRIORITY: Priority = 100;

struct ServerInner {
    events: EventBus,
    assembler: StreamAssembler,
    plugins: PluginManager,
    connections: DashMap<ConnectionId, Connection>,
    next_connection_id: AtomicU64,
}

/// Shared server core.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self { Self::new() }
}

impl Server {
    /// Create a server with the packet assembler already listening for
    /// [`EventKind::IncomingData`] at [`ASSEMBLER_PRIORITY`].
    #[must_use]
    pub fn new() -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                events: EventBus::new(),
                assembler: StreamAssembler::new(),
                plugins: PluginManager::new(),
                connections: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
            }),
        };
        server.inner.events.register(Listener::new(
            EventKind::IncomingData,
            ASSEMBLER_PRIORITY,
            assemble_incoming,
        ));
        server
    }

    /// Server-level event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus { &self.inner.events }

    /// Fragment store shared by every connection of this server.
    #[must_use]
    pub fn assembler(&self) -> &StreamAssembler { &self.inner.assembler }

    /// Loaded plugins.
    #[must_use]
    pub fn plugins(&self) -> &PluginManager { &self.inner.plugins }

    /// Load `plugin`, running its `on_load` hook.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyLoaded`] if a plugin with the same id is
    /// already registered.
    pub fn load_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.inner.plugins.load(self, plugin)
    }

    /// Unload the plugin registered under `id`, running its `on_unload` hook.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotLoaded`] if no such plugin is registered.
    pub fn unload_plugin(&self, id: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        self.inner.plugins.unload(self, id)
    }

    /// Publish `event` on the server bus only.
    ///
    /// # Errors
    ///
    /// See [`EventBus::publish`].
    pub fn publish(&self, event: &Event) -> Result<(), DispatchError> {
        self.inner.events.publish(event)
    }

    /// Open connection with the given id, if it is still registered.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner
            .connections
            .get(&id)
            .map(|entry| entry.value().clone())
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize { self.inner.connections.len() }

    /// Snapshot of every registered connection.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn track(&self, connection: &Connection) {
        self.inner
            .connections
            .insert(connection.id(), connection.clone());
    }

    /// Forget `connection` and drop whatever partial packet it left behind.
    ///
    /// Returns the number of discarded fragment bytes.
    pub(crate) fn release(&self, connection: &Connection) -> usize {
        self.inner.connections.remove(&connection.id());
        connection
            .key()
            .and_then(|key| self.inner.assembler.discard(key))
            .map_or(0, |bytes| bytes.len())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_count())
            .field("pending_fragments", &self.inner.assembler.pending_count())
            .field("plugins", &self.inner.plugins.len())
            .finish_non_exhaustive()
    }
}

fn assemble_incoming(event: &Event) -> ListenerResult {
    let (Some(connection), Some(data)) = (event.connection(), event.data()) else {
        return Ok(());
    };
    let now = tokio::time::Instant::now().into_std();
    let packets = connection
        .server()
        .assembler()
        .assemble_at(connection.key(), data.clone(), now);
    for packet in packets {
        crate::metrics::inc_packets_assembled();
        connection
            .publish(&Event::packet_received(connection, packet))
            .map_err(ListenerError::new)?;
    }
    Ok(())
}

/// Tokio runner for a [`Server`].
///
/// The runner carries a typestate `S` indicating whether it is [`Unbound`]
/// (no TCP listener yet) or [`Bound`]. Only bound runners expose
/// [`run`](ArcieraServer::run).
pub struct ArcieraServer<S = Unbound>
where
    S: ServerState,
{
    pub(crate) server: Server,
    pub(crate) workers: usize,
    pub(crate) backoff_config: BackoffConfig,
    pub(crate) read_buffer_capacity: usize,
    pub(crate) eviction: Option<FragmentEvictionConfig>,
    /// Channel used to notify when the server is accepting connections.
    ///
    /// A `oneshot::Sender` transmits a single notification, so a new sender
    /// must be provided each time a runner is started.
    pub(crate) ready_tx: Option<oneshot::Sender<()>>,
    pub(crate) state: S,
}

impl<S: ServerState + fmt::Debug> fmt::Debug for ArcieraServer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcieraServer")
            .field("server", &self.server)
            .field("workers", &self.workers)
            .field("backoff_config", &self.backoff_config)
            .field("read_buffer_capacity", &self.read_buffer_capacity)
            .field("eviction", &self.eviction)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Marker indicating the runner has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the runner is bound to a TCP listener.
#[derive(Debug, Clone)]
pub struct Bound {
    pub(crate) listener: Arc<TcpListener>,
}

/// Trait implemented by [`Unbound`] and [`Bound`] to model binding typestate.
pub trait ServerState: sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

/// Default read buffer size for connection sockets.
pub const DEFAULT_READ_BUFFER_CAPACITY: usize = 8 * 1024;
/// Smallest accepted read buffer size.
pub const MIN_READ_BUFFER_CAPACITY: usize = 64;

/// Idle-fragment eviction settings.
///
/// When enabled, a sweep task wakes every `sweep_interval` and discards any
/// partial packet that has not grown for longer than `idle_timeout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentEvictionConfig {
    /// Age after which an untouched fragment is discarded.
    pub idle_timeout: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
}

impl FragmentEvictionConfig {
    /// Evict after `idle_timeout`, sweeping at a quarter of that period.
    #[must_use]
    pub fn after(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            sweep_interval: idle_timeout / 4,
        }
        .normalized()
    }

    /// Clamp both durations to at least one millisecond.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use arciera::server::FragmentEvictionConfig;
    ///
    /// let cfg = FragmentEvictionConfig {
    ///     idle_timeout: Duration::ZERO,
    ///     sweep_interval: Duration::ZERO,
    /// }
    /// .normalized();
    /// assert_eq!(cfg.idle_timeout, Duration::from_millis(1));
    /// assert_eq!(cfg.sweep_interval, Duration::from_millis(1));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.idle_timeout = self.idle_timeout.max(Duration::from_millis(1));
        self.sweep_interval = self.sweep_interval.max(Duration::from_millis(1));
        self
    }
}

mod config;
mod connection;
pub mod error;
mod eviction;
mod runtime;

pub use error::ServerError;
pub use runtime::BackoffConfig;

#[cfg(test)]
pub(crate) mod test_util;
