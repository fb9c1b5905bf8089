//! Error types for the transaction server.

use std::io;
use thiserror::Error;

/// Errors surfaced by [`Server`](crate::server::Server) operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Socket-level failure outside of bind.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The server is shutting down or has shut down. Callers of `start`
    /// treat this as a clean exit.
    #[error("server closed")]
    ServerClosed,

    /// The shutdown deadline fired before every connection drained.
    #[error("shutdown deadline exceeded")]
    DeadlineExceeded,
}

impl ServerError {
    /// Returns `true` for the `ServerClosed` condition.
    pub fn is_closed(&self) -> bool {
        matches!(self, ServerError::ServerClosed)
    }
}
