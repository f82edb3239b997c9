//! # kmsd-server
//!
//! Listener, admission and dispatch layers of the kmsd activation daemon.
//!
//! The server binds the configured addresses, waits on all listening
//! sockets at once, and hands every accepted connection to a
//! [`ConnectionHandler`] through one of three execution strategies:
//!
//! | Strategy | Runs the handler | Admission |
//! |----------|------------------|-----------|
//! | `Inline` | on the accepting thread | serialized |
//! | `ThreadSpawn` | on a detached thread | shared permit pool |
//! | `ProcessFork` | in a forked child | process-shared permit pool |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::net::TcpStream;
//!
//! use kmsd_server::{AssociationGroupId, Server, ServerConfig, ServerError};
//!
//! fn echo(stream: &mut TcpStream, _group: AssociationGroupId) {
//!     let mut buf = [0u8; 512];
//!     while let Ok(n) = stream.read(&mut buf) {
//!         if n == 0 || stream.write_all(&buf[..n]).is_err() {
//!             break;
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), ServerError> {
//! let config = ServerConfig::local(1688).with_max_connections(16);
//! let mut server = Server::builder(config, echo).build()?;
//! server.bind_configured()?;
//! let shutdown = server.shutdown_signal();
//! shutdown.install_os_handlers().map_err(ServerError::Signal)?;
//! server.run()
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

#[cfg(not(unix))]
compile_error!("kmsd-server relies on fork, poll and POSIX semaphores and only builds on unix");

mod acceptor;
mod admission;
mod client;
mod dispatch;
mod error;
mod listener;
mod server;
mod signals;

// Re-exports from kmsd-core
pub use kmsd_core::{
    AddressError, AddressFamily, AddressSpec, AssociationGroupId, ConnectionHandler,
    DEFAULT_PORT, ExecutionStrategy, RandomProvider, ResolveHints, SeededRandomProvider,
    ServeMode, ServerConfig, ThreadRngProvider,
};

// Listener exports
pub use acceptor::{Acceptor, accept_any, is_transient};
pub use listener::{ListenerSet, ListeningSocket, MAX_LISTENERS, listen_on_address};

// Admission exports
pub use admission::{AdmissionController, AdmissionPermit, PermitStats};

// Dispatch exports
pub use dispatch::{
    ConnectionOutcome, ConnectionSettings, Dispatcher, OsThreadSpawner, Work, WorkerSpawner,
    serve_client,
};

// Server exports
pub use error::{DispatchError, ServerError, ServerResult};
pub use server::{Server, ServerBuilder};
pub use signals::ShutdownSignal;

// Client exports
pub use client::{
    CONNECT_TIMEOUT, ConnectError, check_protocol_stack, connect_to_address, is_disconnected,
};
