//! Test helpers shared across server modules.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use rstest::fixture;

use super::{ArcieraServer, Bound, Server};

/// Returns a bound [`StdTcpListener`] on a free local port.
///
/// Keeping the listener bound prevents another process from claiming the port
/// between discovery and use.
#[fixture]
pub fn free_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("Failed to bind free port listener")
}

/// Extract the bound address from a listener.
#[must_use]
pub fn listener_addr(listener: &StdTcpListener) -> SocketAddr {
    listener
        .local_addr()
        .expect("failed to get listener address")
}

/// Bind a runner for `server` to `listener`.
pub fn bind_server(server: Server, listener: StdTcpListener) -> ArcieraServer<Bound> {
    ArcieraServer::with_server(server)
        .workers(1)
        .bind_existing_listener(listener)
        .expect("Failed to bind")
}
