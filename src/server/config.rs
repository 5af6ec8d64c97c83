//! Builder methods and listener binding for [`ArcieraServer`].

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
};

use tokio::{net::TcpListener, sync::oneshot};

use super::{
    ArcieraServer,
    BackoffConfig,
    Bound,
    DEFAULT_READ_BUFFER_CAPACITY,
    FragmentEvictionConfig,
    MIN_READ_BUFFER_CAPACITY,
    Server,
    ServerError,
    ServerState,
    Unbound,
};

impl ArcieraServer<Unbound> {
    /// Create a runner around a fresh [`Server`].
    ///
    /// The worker count defaults to the number of available CPU cores (or 1
    /// if this cannot be determined). Call [`bind`](Self::bind) before
    /// running.
    #[must_use]
    pub fn new() -> Self { Self::with_server(Server::new()) }

    /// Create a runner around an existing [`Server`], keeping its listeners
    /// and plugins.
    #[must_use]
    pub fn with_server(server: Server) -> Self {
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            server,
            workers,
            backoff_config: BackoffConfig::default(),
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
            eviction: None,
            ready_tx: None,
            state: Unbound,
        }
    }

    /// Return `None` as the runner is not bound.
    ///
    /// ```
    /// use arciera::server::ArcieraServer;
    ///
    /// assert!(ArcieraServer::new().local_addr().is_none());
    /// ```
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> { None }
}

impl Default for ArcieraServer<Unbound> {
    fn default() -> Self { Self::new() }
}

impl<S: ServerState> ArcieraServer<S> {
    /// Set the number of accept workers.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    /// Configure the back-off applied after failed `accept()` calls.
    #[must_use]
    pub fn accept_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff_config = config.normalized();
        self
    }

    /// Set the per-connection socket read buffer size in bytes.
    #[must_use]
    pub fn read_buffer_capacity(mut self, bytes: usize) -> Self {
        self.read_buffer_capacity = bytes.max(MIN_READ_BUFFER_CAPACITY);
        self
    }

    /// Periodically discard partial packets that stopped growing.
    #[must_use]
    pub fn evict_idle_fragments(mut self, config: FragmentEvictionConfig) -> Self {
        self.eviction = Some(config.normalized());
        self
    }

    /// Configure a channel signalled once the runner is accepting connections.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// Shared server core driven by this runner.
    #[must_use]
    pub fn server(&self) -> &Server { &self.server }

    /// Configured number of accept workers.
    #[inline]
    #[must_use]
    pub const fn worker_count(&self) -> usize { self.workers }

    /// Configured accept back-off.
    #[must_use]
    pub const fn backoff_config(&self) -> BackoffConfig { self.backoff_config }

    /// Configured read buffer size.
    #[must_use]
    pub const fn read_buffer_size(&self) -> usize { self.read_buffer_capacity }

    /// Configured idle-fragment eviction, if enabled.
    #[must_use]
    pub const fn fragment_eviction(&self) -> Option<FragmentEvictionConfig> { self.eviction }

    /// Bind to a fresh address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the socket cannot be bound.
    pub fn bind(self, addr: SocketAddr) -> Result<ArcieraServer<Bound>, ServerError> {
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_existing_listener(std_listener)
    }

    /// Bind to an already-open standard listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot be made
    /// non-blocking or registered with Tokio.
    pub fn bind_existing_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<ArcieraServer<Bound>, ServerError> {
        let ArcieraServer {
            server,
            workers,
            backoff_config,
            read_buffer_capacity,
            eviction,
            ready_tx,
            ..
        } = self;

        std_listener
            .set_nonblocking(true)
            .map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(std_listener).map_err(ServerError::Bind)?;

        Ok(ArcieraServer {
            server,
            workers,
            backoff_config,
            read_buffer_capacity,
            eviction,
            ready_tx,
            state: Bound {
                listener: Arc::new(listener),
            },
        })
    }
}

impl ArcieraServer<Bound> {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.state.listener.local_addr().ok() }
}
