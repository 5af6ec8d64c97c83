//! Per-connection socket task.

use std::{net::SocketAddr, panic::AssertUnwindSafe};

use bytes::BytesMut;
use futures::FutureExt;
use log::{debug, error, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::Server;
use crate::{
    connection::{Connection, ConnectionIo},
    event::Event,
};

#[derive(Clone, Debug)]
pub(super) struct ConnectionOptions {
    pub shutdown: CancellationToken,
    pub read_buffer_capacity: usize,
}

/// Spawn a task to process a single TCP connection, logging and discarding
/// any panic it raises.
pub(super) fn spawn_connection_task(
    stream: TcpStream,
    server: Server,
    options: ConnectionOptions,
    tracker: &TaskTracker,
) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("Failed to retrieve peer address: error={e}");
            None
        }
    };
    tracker.spawn(async move {
        let fut =
            AssertUnwindSafe(process_stream(stream, peer_addr, server, options)).catch_unwind();

        if let Err(panic) = fut.await {
            crate::metrics::inc_connection_panics();
            let panic_msg = crate::panic::format_panic(&*panic);
            // Emit via both `log` and `tracing` for tests that capture either.
            error!("connection task panicked: panic={panic_msg}, peer_addr={peer_addr:?}");
            tracing::error!(panic = %panic_msg, ?peer_addr, "connection task panicked");
        }
    });
}

/// Unregisters a connection however its task ends, including by panic.
struct Teardown {
    connection: Connection,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.connection.close();
        let discarded = self.connection.server().release(&self.connection);
        if discarded > 0 {
            debug!(
                "discarded incomplete packet: id={}, peer_addr={:?}, bytes={discarded}",
                self.connection.id(),
                self.connection.peer_addr()
            );
        }
        crate::metrics::dec_connections();
    }
}

fn publish_logged(connection: &Connection, event: &Event) {
    if let Err(e) = connection.publish(event) {
        warn!(
            "listener dispatch failed: kind={}, id={}, error={e}",
            event.kind(),
            connection.id()
        );
    }
}

async fn process_stream(
    mut stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    server: Server,
    options: ConnectionOptions,
) {
    let (connection, mut io) = Connection::open(&server, peer_addr);
    crate::metrics::inc_connections();
    let _teardown = Teardown {
        connection: connection.clone(),
    };
    debug!(
        "connection accepted: id={}, peer_addr={peer_addr:?}",
        connection.id()
    );

    if let Err(e) = server.publish(&Event::connected(&connection)) {
        warn!(
            "listener dispatch failed: kind=connected, id={}, error={e}",
            connection.id()
        );
    }

    let closed = io.close_token();
    let mut buf = BytesMut::with_capacity(options.read_buffer_capacity);
    loop {
        buf.reserve(options.read_buffer_capacity);
        select! {
            biased;

            () = options.shutdown.cancelled() => break,
            () = closed.cancelled() => break,
            Some(bytes) = io.next_outbound() => {
                if let Err(e) = stream.write_all(&bytes).await {
                    warn!(
                        "socket write failed: error={e}, id={}, peer_addr={peer_addr:?}",
                        connection.id()
                    );
                    break;
                }
            }
            res = stream.read_buf(&mut buf) => match res {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    publish_logged(&connection, &Event::incoming_data(&connection, chunk));
                }
                Err(e) => {
                    warn!(
                        "socket read failed: error={e}, id={}, peer_addr={peer_addr:?}",
                        connection.id()
                    );
                    break;
                }
            },
        }
    }

    publish_logged(&connection, &Event::connection_end(&connection));
    flush_outbound(&mut stream, &mut io).await;
    if let Err(e) = stream.shutdown().await {
        debug!(
            "socket shutdown failed: error={e}, id={}",
            connection.id()
        );
    }
}

/// Write whatever listeners queued before the socket closes.
async fn flush_outbound(stream: &mut TcpStream, io: &mut ConnectionIo) {
    while let Some(bytes) = io.try_next_outbound() {
        if stream.write_all(&bytes).await.is_err() {
            break;
        }
    }
}
