//! Readiness multiplexing over the listener set.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;

use crate::listener::ListenerSet;

/// Whether an accept-loop error is worth retrying.
///
/// Interrupted waits (a signal arrived) and connections aborted between
/// readiness and `accept` are transient; everything else stops the server.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}

/// Waits on every listener and accepts one connection per call.
///
/// The readiness set is built once; the listener set does not change while
/// the acceptor borrows it.
pub struct Acceptor<'a> {
    listeners: &'a ListenerSet,
    fds: Vec<libc::pollfd>,
}

impl<'a> Acceptor<'a> {
    /// Build the readiness set from every listener in `listeners`.
    pub fn new(listeners: &'a ListenerSet) -> Self {
        let fds = listeners
            .iter()
            .map(|socket| libc::pollfd {
                fd: socket.listener().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        Self { listeners, fds }
    }

    /// Block until a listener is ready and accept on it.
    ///
    /// When several listeners are ready, the earliest registered one wins.
    ///
    /// # Errors
    ///
    /// Returns the error of the readiness wait or of `accept`. Use
    /// [`is_transient`] to tell retryable errors apart. An empty listener
    /// set is rejected with `InvalidInput` instead of waiting forever.
    pub fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        if self.fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listening sockets",
            ));
        }

        loop {
            for fd in &mut self.fds {
                fd.revents = 0;
            }

            // Safety: fds is a valid, initialized pollfd array of the given length.
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    -1,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }

            let ready = self.fds.iter().position(|fd| fd.revents != 0);
            if let Some(socket) = ready.and_then(|index| self.listeners.get(index)) {
                return socket.listener().accept();
            }
        }
    }
}

/// Accept one connection on whichever listener becomes ready first.
///
/// Convenience for one-off calls; loops should keep an [`Acceptor`].
///
/// # Errors
///
/// See [`Acceptor::accept`].
pub fn accept_any(listeners: &ListenerSet) -> io::Result<(TcpStream, SocketAddr)> {
    Acceptor::new(listeners).accept()
}
