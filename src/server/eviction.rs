//! Background sweep discarding fragments that stopped growing.

use std::time::{Duration, Instant};

use log::debug;
use tokio::{select, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{FragmentEvictionConfig, Server};

/// Evict every fragment idle for at least `idle_timeout` as of `now`.
///
/// Returns the number of evicted fragments.
pub(super) fn sweep_once(server: &Server, idle_timeout: Duration, now: Instant) -> usize {
    let evicted = server.assembler().purge_idle_at(now, idle_timeout);
    for key in &evicted {
        debug!("evicted idle fragment: key={key}, idle_timeout={idle_timeout:?}");
    }
    if !evicted.is_empty() {
        crate::metrics::inc_fragments_evicted(evicted.len() as u64);
    }
    evicted.len()
}

pub(super) async fn sweep_idle_fragments(
    server: Server,
    config: FragmentEvictionConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        select! {
            biased;

            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let now = tokio::time::Instant::now().into_std();
                sweep_once(&server, config.idle_timeout, now);
            }
        }
    }
}
