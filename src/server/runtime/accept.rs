//! Accept loop feeding sockets to connection tasks.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::warn;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{Duration, sleep},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::backoff::BackoffConfig;
use crate::server::{
    Server,
    connection::{ConnectionOptions, spawn_connection_task},
};

/// Source of incoming connections consumed by the accept loop.
///
/// Dropping a pending `accept()` future must not leak resources.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

#[derive(Clone, Debug)]
pub(in crate::server) struct AcceptLoopOptions {
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: BackoffConfig,
    pub read_buffer_capacity: usize,
}

/// Accept sockets from `listener` until `options.shutdown` is cancelled.
///
/// Each socket gets its own task on `options.tracker`. Accept failures are
/// logged and retried after an exponential back-off.
pub(in crate::server) async fn accept_loop<L>(
    listener: Arc<L>,
    server: Server,
    options: AcceptLoopOptions,
) where
    L: AcceptListener + 'static,
{
    let backoff = options.backoff.normalized();
    let connection_options = ConnectionOptions {
        shutdown: options.shutdown.clone(),
        read_buffer_capacity: options.read_buffer_capacity,
    };
    let mut delay = backoff.initial_delay;
    loop {
        select! {
            biased;

            () = options.shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, _)) => {
                    spawn_connection_task(
                        stream,
                        server.clone(),
                        connection_options.clone(),
                        &options.tracker,
                    );
                    delay = backoff.initial_delay;
                }
                Err(e) => {
                    let local_addr = listener.local_addr().ok();
                    warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                    retry_after(delay, &options.shutdown).await;
                    delay = backoff.next_delay(delay);
                }
            },
        }
    }
}

async fn retry_after(delay: Duration, shutdown: &CancellationToken) {
    select! {
        () = shutdown.cancelled() => {}
        () = sleep(delay) => {}
    }
}
