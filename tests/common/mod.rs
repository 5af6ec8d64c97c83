//! Shared utilities for integration tests.
//!
//! Provides a running server bound to a free local port and a channel-backed
//! recorder for events observed by listeners.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    time::Duration,
};

use arciera::{ArcieraServer, Server, ServerError};
use rstest::fixture;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Create a TCP listener bound to a free local port.
#[fixture]
pub fn unused_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("failed to bind port")
}

/// A server running on a background task until [`stop`](Self::stop).
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    /// Bind `server` to `listener` and wait until it accepts connections.
    pub async fn start(server: Server, listener: StdTcpListener) -> Self {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let runner = ArcieraServer::with_server(server)
            .workers(2)
            .ready_signal(ready_tx)
            .bind_existing_listener(listener)
            .expect("bind listener");
        let addr = runner.local_addr().expect("bound address");
        let handle = tokio::spawn(runner.run_with_shutdown(async {
            let _ = shutdown_rx.await;
        }));
        timeout(WAIT, ready_rx)
            .await
            .expect("server ready in time")
            .expect("ready signal sent");
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    /// Signal shutdown and wait for every connection task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        timeout(WAIT, self.handle)
            .await
            .expect("server stopped in time")
            .expect("server join")
            .expect("server run");
    }
}

/// Receive the next recorded item or fail after [`WAIT`].
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("event arrived in time")
        .expect("recorder still open")
}
