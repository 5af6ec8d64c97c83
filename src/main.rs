//! Demonstration binary for `arciera`.
//!
//! Binds the configured address, logs connection and packet events, and runs
//! until Ctrl+C.

mod cli;

use std::{net::SocketAddr, time::Duration};

use arciera::{
    ArcieraServer,
    DEFAULT_PRIORITY,
    EventKind,
    EventPayload,
    Server,
    ServerError,
    server::FragmentEvictionConfig,
};
use clap::Parser;
use cli::{Cli, LogLevel};
use tracing::Level;

fn max_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Trace => Level::TRACE,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warn => Level::WARN,
        LogLevel::Error => Level::ERROR,
    }
}

/// Log every lifecycle event at a level matching its volume.
fn log_lifecycle(server: &Server) {
    let events = server.events();
    events.on(EventKind::ServerListening, DEFAULT_PRIORITY, |event| {
        if let EventPayload::ServerListening { local_addr } = event.payload() {
            tracing::info!(?local_addr, "listening");
        }
        Ok(())
    });
    events.on(EventKind::Connected, DEFAULT_PRIORITY, |event| {
        if let Some(connection) = event.connection() {
            tracing::info!(id = %connection.id(), peer_addr = ?connection.peer_addr(), "connected");
        }
        Ok(())
    });
    events.on(EventKind::PacketReceived, DEFAULT_PRIORITY, |event| {
        if let (Some(connection), Some(packet)) = (event.connection(), event.packet()) {
            tracing::debug!(id = %connection.id(), len = packet.len(), "packet received");
        }
        Ok(())
    });
    events.on(EventKind::ConnectionEnd, DEFAULT_PRIORITY, |event| {
        if let Some(connection) = event.connection() {
            tracing::info!(id = %connection.id(), "connection ended");
        }
        Ok(())
    });
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt()
        .with_max_level(max_level(cli.log_level))
        .init();

    let server = Server::new();
    log_lifecycle(&server);

    let mut runner = ArcieraServer::with_server(server);
    if let Some(workers) = cli.workers {
        runner = runner.workers(workers);
    }
    if let Some(secs) = cli.fragment_idle_secs {
        let config = FragmentEvictionConfig::after(Duration::from_secs(secs));
        runner = runner.evict_idle_fragments(config);
    }
    runner.bind(SocketAddr::new(cli.host, cli.port))?.run().await
}
