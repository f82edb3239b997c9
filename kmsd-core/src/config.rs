//! Server configuration.
//!
//! Loading the configuration (command line, ini file, service manager) is
//! the binary's job; this module only defines the values the server
//! consumes. Every field has a default, so a partial document deserializes.

use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::AddressFamily;

/// Port of the activation service.
pub const DEFAULT_PORT: u16 = 1688;

/// Default per-connection I/O timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// How the daemon gets its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeMode {
    /// Bind listening sockets and accept until shutdown.
    #[default]
    Standalone,
    /// Serve the single pre-connected descriptor on stdin, then return.
    SingleShot,
}

/// How an accepted connection is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// On the accepting thread, one connection at a time.
    Inline,
    /// On a detached OS thread per connection.
    #[default]
    ThreadSpawn,
    /// In a forked child process per connection (unix only).
    ProcessFork,
}

/// Configuration consumed by the listener, admission and dispatch layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address strings to listen on (`host`, `host:port`, `[v6]:port`).
    pub listen: Vec<String>,

    /// Port used when an address string carries none.
    pub default_port: u16,

    /// Send/receive timeout applied to every accepted connection, in
    /// seconds. Zero disables the timeout.
    pub connection_timeout_secs: u64,

    /// Maximum number of concurrently served connections.
    /// None means unlimited.
    pub max_connections: Option<NonZeroU32>,

    /// Standalone listener or single pre-connected descriptor.
    pub mode: ServeMode,

    /// Family restriction for listen addresses.
    pub address_family: AddressFamily,

    /// Worker execution strategy for standalone mode.
    pub execution: ExecutionStrategy,

    /// Log peer addresses when connections are accepted and closed.
    pub log_connections: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0".to_owned(), "[::]".to_owned()],
            default_port: DEFAULT_PORT,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            max_connections: None,
            mode: ServeMode::Standalone,
            address_family: AddressFamily::Any,
            execution: ExecutionStrategy::default(),
            log_connections: true,
        }
    }
}

impl ServerConfig {
    /// Configuration for inetd-style invocation: one connection on stdin.
    pub fn inetd() -> Self {
        Self {
            listen: Vec::new(),
            mode: ServeMode::SingleShot,
            execution: ExecutionStrategy::Inline,
            ..Self::default()
        }
    }

    /// Configuration listening on loopback only.
    pub fn local(port: u16) -> Self {
        Self {
            listen: vec![format!("127.0.0.1:{port}"), format!("[::1]:{port}")],
            default_port: port,
            ..Self::default()
        }
    }

    /// Replace the listen addresses.
    pub fn with_listen<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listen = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Set the connection cap. Zero means unlimited.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = NonZeroU32::new(max);
        self
    }

    /// Set the per-connection timeout in seconds.
    pub fn with_connection_timeout_secs(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the execution strategy.
    pub fn with_execution(mut self, execution: ExecutionStrategy) -> Self {
        self.execution = execution;
        self
    }

    /// Enable or disable peer diagnostics.
    pub fn with_log_connections(mut self, enabled: bool) -> Self {
        self.log_connections = enabled;
        self
    }

    /// The per-connection timeout, or `None` when disabled.
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_secs > 0).then(|| Duration::from_secs(self.connection_timeout_secs))
    }

    /// Whether admission control applies.
    ///
    /// It never does in single-shot mode, where exactly one connection is
    /// served.
    pub fn admission_enabled(&self) -> bool {
        self.mode == ServeMode::Standalone && self.max_connections.is_some()
    }

    /// The strategy actually used: single-shot mode always runs inline.
    pub fn effective_strategy(&self) -> ExecutionStrategy {
        match self.mode {
            ServeMode::SingleShot => ExecutionStrategy::Inline,
            ServeMode::Standalone => self.execution,
        }
    }
}
