//! Errors raised by [`ArcieraServer`](super::ArcieraServer) operations.

use std::io;

use thiserror::Error;

/// Errors that may occur while setting up the server.
///
/// Accept failures are retried with back-off by the accept loop and are
/// never reported through this type.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or configuring the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),
}
