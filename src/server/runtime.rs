//! Runtime control for [`ArcieraServer`].

mod accept;
mod backoff;
#[cfg(test)]
mod tests;

use std::sync::Arc;

#[cfg(test)]
pub(super) use accept::MockAcceptListener;
pub(super) use accept::{AcceptLoopOptions, accept_loop};
pub use backoff::BackoffConfig;
use futures::Future;
use log::{debug, warn};
use tokio::{select, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{ArcieraServer, Bound, ServerError, eviction::sweep_idle_fragments};
use crate::event::Event;

impl ArcieraServer<Bound> {
    /// Run until Ctrl+C is received.
    ///
    /// ```no_run
    /// use arciera::server::ArcieraServer;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), arciera::server::ServerError> {
    /// ArcieraServer::new()
    ///     .bind(([127, 0, 0, 1], 25565).into())?
    ///     .run()
    ///     .await
    /// # }
    /// ```
    ///
    /// Running an unbound server fails to compile:
    ///
    /// ```compile_fail
    /// use arciera::server::ArcieraServer;
    ///
    /// async fn try_run() {
    ///     ArcieraServer::new().run().await.expect("unbound");
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// Accept failures are retried with back-off and never surface here, so
    /// this currently always returns `Ok(())` once shutdown completes.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run until `shutdown` resolves.
    ///
    /// Publishes [`EventKind::ServerListening`](crate::event::EventKind) on
    /// the server bus before any connection is accepted, then spawns the
    /// accept workers and, if configured, the idle-fragment sweep, and fires
    /// the ready signal. On shutdown every
    /// connection task is asked to stop, each open connection publishes its
    /// `ConnectionEnd`, and loaded plugins are unloaded.
    ///
    /// ```
    /// use arciera::server::ArcieraServer;
    /// use tokio::sync::oneshot;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), arciera::server::ServerError> {
    /// let runner = ArcieraServer::new().bind(([127, 0, 0, 1], 0).into())?;
    /// let (tx, rx) = oneshot::channel::<()>();
    /// let handle = tokio::spawn(runner.run_with_shutdown(async {
    ///     let _ = rx.await;
    /// }));
    /// let _ = tx.send(());
    /// handle.await.expect("join server task")?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let ArcieraServer {
            server,
            workers,
            backoff_config,
            read_buffer_capacity,
            eviction,
            ready_tx,
            state: Bound { listener },
        } = self;
        let shutdown_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let local_addr = listener.local_addr().ok();
        debug!("server listening: local_addr={local_addr:?}, workers={workers}");
        if let Err(e) = server.publish(&Event::server_listening(&server, local_addr)) {
            warn!("server listening dispatch failed: error={e}");
        }

        for _ in 0..workers {
            tracker.spawn(accept_loop(
                Arc::clone(&listener),
                server.clone(),
                AcceptLoopOptions {
                    shutdown: shutdown_token.clone(),
                    tracker: tracker.clone(),
                    backoff: backoff_config,
                    read_buffer_capacity,
                },
            ));
        }
        if let Some(config) = eviction {
            tracker.spawn(sweep_idle_fragments(
                server.clone(),
                config,
                shutdown_token.clone(),
            ));
        }

        // Signal readiness after all workers have been spawned.
        if let Some(tx) = ready_tx
            && tx.send(()).is_err()
        {
            warn!("Failed to send readiness signal: receiver dropped");
        }

        select! {
            () = shutdown => shutdown_token.cancel(),
            () = tracker.wait() => {},
        }

        tracker.close();
        tracker.wait().await;
        server.plugins().unload_all(&server);
        Ok(())
    }
}
