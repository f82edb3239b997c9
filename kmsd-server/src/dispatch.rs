//! Dispatching accepted connections to the protocol engine.
//!
//! Every strategy runs the same per-connection sequence ([`serve_client`]):
//! apply the I/O timeouts, optionally log the peer, call the handler, close.
//! The strategies only differ in where that sequence runs:
//!
//! ```text
//! Inline       acceptor thread, one connection at a time
//! ThreadSpawn  acquire permit -> detached thread -> serve -> release
//! ProcessFork  acquire permit -> fork -> child: serve -> release -> _exit
//!                                     -> parent: close copy, keep accepting
//! ```

use std::io;
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use kmsd_core::{
    AssociationGroupId, ConnectionHandler, ExecutionStrategy, ServerConfig, family_label,
};

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::error::DispatchError;
use crate::signals;

/// Per-connection settings applied before the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Symmetric send/receive timeout. `None` disables it.
    pub timeout: Option<Duration>,
    /// Log the peer address on accept and close.
    pub log_connections: bool,
}

impl ConnectionSettings {
    /// Settings taken from the server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            timeout: config.connection_timeout(),
            log_connections: config.log_connections,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// How a connection left [`serve_client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The handler ran to completion.
    Served,
    /// Setup failed; the connection was closed without calling the handler.
    SetupFailed,
}

fn apply_timeouts(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)
}

/// Run one connection through setup, handler and close.
///
/// The stream is closed when this returns, whatever the outcome.
pub fn serve_client<H>(
    mut stream: TcpStream,
    group: AssociationGroupId,
    settings: &ConnectionSettings,
    handler: &H,
) -> ConnectionOutcome
where
    H: ConnectionHandler + ?Sized,
{
    if let Err(e) = apply_timeouts(&stream, settings.timeout) {
        if e.raw_os_error() == Some(libc::ENOTSOCK) {
            tracing::error!(error = %e, "fatal: connection descriptor is not a socket");
        } else {
            tracing::warn!(error = %e, "cannot set connection timeouts");
        }
        return ConnectionOutcome::SetupFailed;
    }

    let peer = if settings.log_connections {
        match stream.peer_addr() {
            Ok(peer) => {
                tracing::info!(
                    peer = %peer,
                    group = %group,
                    "{} connection accepted",
                    family_label(&peer)
                );
                Some(peer)
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot resolve peer address");
                return ConnectionOutcome::SetupFailed;
            }
        }
    } else {
        None
    };

    handler.handle(&mut stream, group);

    if let Some(peer) = peer {
        tracing::info!(
            peer = %peer,
            group = %group,
            "{} connection closed",
            family_label(&peer)
        );
    }
    ConnectionOutcome::Served
}

/// A unit of work for [`WorkerSpawner`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Creates detached units of execution for the thread strategy.
///
/// Implementations must not wait for `work` to finish.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start `work` on a new, never-joined unit of execution.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the unit cannot be created. `work` must
    /// then not run.
    fn spawn(&self, name: String, work: Work) -> io::Result<()>;
}

/// Spawns one detached OS thread per connection.
#[derive(Debug, Clone, Default)]
pub struct OsThreadSpawner {
    stack_size: Option<usize>,
}

impl OsThreadSpawner {
    /// Spawner using the platform default stack size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawner with an explicit stack size in bytes.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl WorkerSpawner for OsThreadSpawner {
    fn spawn(&self, name: String, work: Work) -> io::Result<()> {
        let mut builder = thread::Builder::new().name(name);
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        // Dropping the handle detaches the thread.
        builder.spawn(work).map(drop)
    }
}

/// An accepted connection on its way to a worker.
struct ConnectionTask {
    stream: TcpStream,
    group: AssociationGroupId,
    permit: AdmissionPermit,
}

/// Hands accepted connections to the handler using one fixed strategy.
pub struct Dispatcher<H> {
    strategy: ExecutionStrategy,
    handler: Arc<H>,
    settings: ConnectionSettings,
    admission: AdmissionController,
    spawner: Arc<dyn WorkerSpawner>,
    /// Pids of forked workers not yet reaped.
    workers: Mutex<Vec<libc::pid_t>>,
}

impl<H: ConnectionHandler> Dispatcher<H> {
    /// Create a dispatcher. The thread strategy uses [`OsThreadSpawner`]
    /// unless [`with_spawner`](Self::with_spawner) says otherwise.
    pub fn new(
        strategy: ExecutionStrategy,
        handler: Arc<H>,
        settings: ConnectionSettings,
        admission: AdmissionController,
    ) -> Self {
        Self {
            strategy,
            handler,
            settings,
            admission,
            spawner: Arc::new(OsThreadSpawner::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Replace the worker spawner used by the thread strategy.
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// The strategy selected at construction.
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// The admission controller gating dispatch.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// The per-connection settings.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Serve `stream` on the calling thread, bypassing admission.
    pub fn serve_inline(&self, stream: TcpStream, group: AssociationGroupId) -> ConnectionOutcome {
        serve_client(stream, group, &self.settings, &*self.handler)
    }

    /// Hand `stream` to the handler with the configured strategy.
    ///
    /// Blocks while no admission permit is available. Returns once the
    /// connection has been handed off (or, inline, served).
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] when the permit wait or the worker
    /// creation fails. The stream is closed and the permit released first.
    pub fn dispatch(
        &self,
        stream: TcpStream,
        group: AssociationGroupId,
    ) -> Result<(), DispatchError> {
        let permit = self.admission.acquire().map_err(DispatchError::Admission)?;
        let task = ConnectionTask {
            stream,
            group,
            permit,
        };
        match self.strategy {
            ExecutionStrategy::Inline => {
                let ConnectionTask {
                    stream,
                    group,
                    permit,
                } = task;
                self.serve_inline(stream, group);
                permit.release();
                Ok(())
            }
            ExecutionStrategy::ThreadSpawn => self.spawn_thread(task),
            ExecutionStrategy::ProcessFork => self.fork_process(task),
        }
    }

    fn spawn_thread(&self, task: ConnectionTask) -> Result<(), DispatchError> {
        let group = task.group;
        // Exactly one of the worker or the failure path below takes the task.
        let slot = Arc::new(Mutex::new(Some(task)));
        let work: Work = {
            let slot = Arc::clone(&slot);
            let handler = Arc::clone(&self.handler);
            let settings = self.settings;
            Box::new(move || {
                let task = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(task) = task {
                    run_worker(task, &settings, &*handler);
                }
            })
        };

        match self.spawner.spawn(format!("kmsd-conn-{:08x}", group.get()), work) {
            Ok(()) => {
                tracing::trace!(group = %group, "worker thread started");
                Ok(())
            }
            Err(e) => {
                let task = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(ConnectionTask { stream, permit, .. }) = task {
                    drop(stream);
                    permit.release();
                }
                Err(DispatchError::Spawn(e))
            }
        }
    }

    /// Collect exited worker processes without blocking.
    ///
    /// Only pids this dispatcher forked are waited on, so other children of
    /// the process keep their exit status. Returns the number of workers
    /// still running.
    pub fn reap_finished(&self) -> usize {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|&pid| !reap_worker(pid));
        workers.len()
    }

    fn fork_process(&self, task: ConnectionTask) -> Result<(), DispatchError> {
        let ConnectionTask {
            stream,
            group,
            permit,
        } = task;

        // Safety: the child serves this one connection and leaves through
        // _exit without returning into the accept loop.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                let err = io::Error::last_os_error();
                drop(stream);
                permit.release();
                Err(DispatchError::Fork(err))
            }
            0 => {
                signals::install_child_handlers(permit.into_shared());
                let served = panic::catch_unwind(AssertUnwindSafe(|| {
                    serve_client(stream, group, &self.settings, &*self.handler)
                }));
                signals::release_child_permit();
                exit_child(if served.is_ok() { 0 } else { 1 })
            }
            child => {
                // The child owns the connection and the permit now.
                drop(stream);
                permit.hand_off();
                tracing::debug!(pid = child, group = %group, "worker process forked");
                self.workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(child);
                self.reap_finished();
                Ok(())
            }
        }
    }
}

fn run_worker<H>(task: ConnectionTask, settings: &ConnectionSettings, handler: &H)
where
    H: ConnectionHandler + ?Sized,
{
    let ConnectionTask {
        stream,
        group,
        permit,
    } = task;
    let served = panic::catch_unwind(AssertUnwindSafe(|| {
        serve_client(stream, group, settings, handler)
    }));
    if served.is_err() {
        tracing::warn!(group = %group, "connection worker panicked");
    }
    permit.release();
}

/// Wait on `pid` without blocking. Returns whether it is gone.
fn reap_worker(pid: libc::pid_t) -> bool {
    let mut status: libc::c_int = 0;
    // Safety: status is a valid out-pointer.
    let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    match rc {
        0 => false,
        -1 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return false;
            }
            tracing::debug!(pid, error = %err, "cannot wait on worker process");
            true
        }
        _ => {
            if libc::WIFSIGNALED(status) {
                tracing::warn!(
                    pid,
                    signal = libc::WTERMSIG(status),
                    "worker process killed by signal"
                );
            } else if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0 {
                tracing::warn!(
                    pid,
                    code = libc::WEXITSTATUS(status),
                    "worker process exited abnormally"
                );
            } else {
                tracing::trace!(pid, "worker process reaped");
            }
            true
        }
    }
}

/// Terminate a forked worker immediately.
///
/// `_exit` skips atexit handlers and the parent's buffered state.
fn exit_child(code: i32) -> ! {
    // Safety: _exit is always safe to call; it terminates the process.
    unsafe { libc::_exit(code) }
}
