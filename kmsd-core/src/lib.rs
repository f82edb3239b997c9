//! # kmsd-core
//!
//! Core types for the kmsd activation daemon.
//!
//! This crate holds everything the listener and dispatch layers share but
//! that does not touch a socket descriptor directly:
//!
//! - **Addresses**: [`AddressSpec`] parsing and resolution into socket
//!   address candidates
//! - **Configuration**: [`ServerConfig`], [`ServeMode`], [`ExecutionStrategy`]
//! - **Protocol seam**: the [`ConnectionHandler`] trait and the
//!   [`AssociationGroupId`] passed to it
//! - **Randomness**: [`RandomProvider`] used to seed association groups

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod config;
mod error;
mod handler;
mod random;
mod types;

// Address exports
pub use address::{AddressFamily, AddressSpec, MAX_ADDRESS_LEN, ResolveHints, family_label};

// Config exports
pub use config::{
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_PORT, ExecutionStrategy, ServeMode, ServerConfig,
};

// Error exports
pub use error::{AddressError, AddressResult};

// Protocol seam exports
pub use handler::ConnectionHandler;
pub use types::AssociationGroupId;

// Provider exports
pub use random::{RandomProvider, SeededRandomProvider, ThreadRngProvider};
