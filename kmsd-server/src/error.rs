//! Error types for the server.

use std::io;

use thiserror::Error;

/// Errors that end a server run.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No configured address produced a listening socket.
    #[error("no listening socket could be established")]
    NoListeners,

    /// The accept loop hit a non-transient error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The admission pool could not be created.
    #[error("cannot create admission pool: {0}")]
    Admission(#[source] io::Error),

    /// Signal handlers could not be installed.
    #[error("cannot install signal handlers: {0}")]
    Signal(#[source] io::Error),
}

/// Errors that abort a single connection's dispatch.
///
/// The connection is closed and its permit released before any of these is
/// returned; the accept loop keeps running.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Waiting for an admission permit failed.
    #[error("admission wait failed: {0}")]
    Admission(#[source] io::Error),

    /// The worker thread could not be created.
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// The worker process could not be forked.
    #[error("cannot fork worker process: {0}")]
    Fork(#[source] io::Error),
}

/// Result type for server runs.
pub type ServerResult<T> = Result<T, ServerError>;
