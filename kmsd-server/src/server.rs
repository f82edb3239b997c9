//! The server run loop.
//!
//! [`Server::run`] either serves the pre-connected descriptor on stdin
//! (single-shot mode) or accepts on every listening socket until shutdown:
//!
//! ```text
//! loop {
//!     accept on the first ready listener
//!     advance the association group
//!     dispatch (blocks while the admission pool is empty)
//! }
//! ```

use std::net::{SocketAddr, TcpStream};
use std::os::fd::FromRawFd;
use std::sync::Arc;

use kmsd_core::{
    AssociationGroupId, ConnectionHandler, RandomProvider, ServeMode, ServerConfig,
    ThreadRngProvider,
};

use crate::acceptor::{self, Acceptor};
use crate::admission::AdmissionController;
use crate::dispatch::{ConnectionOutcome, ConnectionSettings, Dispatcher, WorkerSpawner};
use crate::error::{ServerError, ServerResult};
use crate::listener::ListenerSet;
use crate::signals::ShutdownSignal;

/// Builder for [`Server`].
pub struct ServerBuilder<H, R = ThreadRngProvider> {
    config: ServerConfig,
    handler: Arc<H>,
    random: R,
    initial_group: Option<AssociationGroupId>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    shutdown: ShutdownSignal,
}

impl<H: ConnectionHandler> ServerBuilder<H, ThreadRngProvider> {
    fn new(config: ServerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            random: ThreadRngProvider::new(),
            initial_group: None,
            spawner: None,
            shutdown: ShutdownSignal::new(),
        }
    }
}

impl<H: ConnectionHandler, R: RandomProvider> ServerBuilder<H, R> {
    /// Use `random` to seed the association group.
    pub fn random<R2: RandomProvider>(self, random: R2) -> ServerBuilder<H, R2> {
        ServerBuilder {
            config: self.config,
            handler: self.handler,
            random,
            initial_group: self.initial_group,
            spawner: self.spawner,
            shutdown: self.shutdown,
        }
    }

    /// Start the association group at `group` instead of a random value.
    ///
    /// The first accepted connection gets `group.next()`.
    pub fn initial_association_group(mut self, group: AssociationGroupId) -> Self {
        self.initial_group = Some(group);
        self
    }

    /// Replace the worker spawner of the thread strategy.
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Share an existing shutdown signal with the server.
    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Create the admission pool and the dispatcher.
    ///
    /// No socket is bound yet; see [`Server::bind_configured`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Admission`] when the pool cannot be created.
    pub fn build(self) -> ServerResult<Server<H>> {
        let admission =
            AdmissionController::from_config(&self.config).map_err(ServerError::Admission)?;
        let mut dispatcher = Dispatcher::new(
            self.config.effective_strategy(),
            self.handler,
            ConnectionSettings::from_config(&self.config),
            admission,
        );
        if let Some(spawner) = self.spawner {
            dispatcher = dispatcher.with_spawner(spawner);
        }

        let group = self
            .initial_group
            .unwrap_or_else(|| AssociationGroupId::new(self.random.random()));
        let listeners = ListenerSet::new(self.config.default_port)
            .with_family(self.config.address_family);

        Ok(Server {
            config: self.config,
            listeners,
            dispatcher,
            shutdown: self.shutdown,
            group,
        })
    }
}

/// Accepts connections and hands them to the protocol handler.
pub struct Server<H> {
    config: ServerConfig,
    listeners: ListenerSet,
    dispatcher: Dispatcher<H>,
    shutdown: ShutdownSignal,
    group: AssociationGroupId,
}

impl<H: ConnectionHandler> Server<H> {
    /// Start building a server for `config` around `handler`.
    pub fn builder(config: ServerConfig, handler: H) -> ServerBuilder<H> {
        ServerBuilder::new(config, handler)
    }

    /// Listen on every configured address.
    ///
    /// Individual failures are logged and skipped. Returns the number of
    /// listening sockets.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NoListeners`] when no socket is listening
    /// afterwards.
    pub fn bind_configured(&mut self) -> ServerResult<usize> {
        for address in &self.config.listen {
            self.listeners.add_listening_socket(address);
        }
        if self.listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }
        Ok(self.listeners.len())
    }

    /// The configuration the server was built from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The listening sockets.
    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    /// The listening sockets, for adding addresses before [`run`](Self::run).
    pub fn listeners_mut(&mut self) -> &mut ListenerSet {
        &mut self.listeners
    }

    /// Bound addresses in registration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.local_addrs()
    }

    /// A handle that stops the accept loop when requested.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// The association group given to the most recent connection (or the
    /// seed before the first one).
    pub fn association_group(&self) -> AssociationGroupId {
        self.group
    }

    /// The admission controller.
    pub fn admission(&self) -> &AdmissionController {
        self.dispatcher.admission()
    }

    /// Run in the configured mode.
    ///
    /// # Errors
    ///
    /// See [`run_standalone`](Self::run_standalone).
    pub fn run(&mut self) -> ServerResult<()> {
        match self.config.mode {
            ServeMode::SingleShot => {
                self.run_single_shot();
                Ok(())
            }
            ServeMode::Standalone => self.run_standalone(),
        }
    }

    /// Serve the connection already open on stdin, then return.
    pub fn run_single_shot(&mut self) -> ConnectionOutcome {
        // Safety: in single-shot mode the service manager passes the
        // connected socket as descriptor 0 and nothing else owns it.
        let stream = unsafe { TcpStream::from_raw_fd(libc::STDIN_FILENO) };
        self.serve_preconnected(stream)
    }

    /// Serve one already connected stream inline, without admission.
    pub fn serve_preconnected(&mut self, stream: TcpStream) -> ConnectionOutcome {
        let group = self.group.advance();
        tracing::debug!(group = %group, "serving pre-connected descriptor");
        self.dispatcher.serve_inline(stream, group)
    }

    /// Accept and dispatch until shutdown or a fatal accept error.
    ///
    /// Listening sockets are closed when the loop ends.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NoListeners`] when nothing is listening and
    /// [`ServerError::Accept`] on a non-transient accept error.
    pub fn run_standalone(&mut self) -> ServerResult<()> {
        if self.listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }
        tracing::info!(
            listeners = self.listeners.len(),
            strategy = ?self.dispatcher.strategy(),
            max_connections = ?self.config.max_connections,
            "server started"
        );

        let result = accept_loop(
            &self.listeners,
            &self.dispatcher,
            &self.shutdown,
            &mut self.group,
        );

        self.listeners.close_all();
        let running = self.dispatcher.reap_finished();
        if running > 0 {
            tracing::debug!(workers = running, "worker processes still running");
        }
        tracing::info!("server stopped");
        result
    }
}

fn accept_loop<H: ConnectionHandler>(
    listeners: &ListenerSet,
    dispatcher: &Dispatcher<H>,
    shutdown: &ShutdownSignal,
    group: &mut AssociationGroupId,
) -> ServerResult<()> {
    let mut acceptor = Acceptor::new(listeners);
    while !shutdown.is_requested() {
        let (stream, peer) = match acceptor.accept() {
            Ok(accepted) => accepted,
            Err(e) if acceptor::is_transient(&e) => continue,
            Err(e) => {
                if shutdown.is_requested() {
                    break;
                }
                tracing::error!(error = %e, "fatal: accept failed");
                return Err(ServerError::Accept(e));
            }
        };

        let id = group.advance();
        if shutdown.is_requested() {
            tracing::debug!(peer = %peer, "shutdown requested, closing connection");
            break;
        }

        if let Err(e) = dispatcher.dispatch(stream, id) {
            tracing::warn!(peer = %peer, group = %id, error = %e, "connection dropped");
        }
    }
    Ok(())
}
