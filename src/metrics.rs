//! Metric helpers for `arciera`.
//!
//! Thin wrappers over the [`metrics`](https://docs.rs/metrics) facade. With
//! the `metrics` feature disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open connections.
pub const CONNECTIONS_ACTIVE: &str = "arciera_connections_active";
/// Name of the counter tracking packets produced by the assembler.
pub const PACKETS_ASSEMBLED: &str = "arciera_packets_assembled_total";
/// Name of the counter tracking fragments dropped by the idle sweep.
pub const FRAGMENTS_EVICTED: &str = "arciera_fragments_evicted_total";
/// Name of the counter tracking caught connection-task panics.
pub const CONNECTION_PANICS: &str = "arciera_connection_panics_total";
/// Name of the counter tracking failed detached listeners.
pub const LISTENER_ERRORS: &str = "arciera_listener_errors_total";

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record one assembled packet.
pub fn inc_packets_assembled() {
    #[cfg(feature = "metrics")]
    counter!(PACKETS_ASSEMBLED).increment(1);
}

/// Record `count` evicted fragments.
pub fn inc_fragments_evicted(count: u64) {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_EVICTED).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record a panic caught in a connection task.
pub fn inc_connection_panics() {
    #[cfg(feature = "metrics")]
    counter!(CONNECTION_PANICS).increment(1);
}

/// Record a detached listener that returned an error.
pub fn inc_listener_errors() {
    #[cfg(feature = "metrics")]
    counter!(LISTENER_ERRORS).increment(1);
}
