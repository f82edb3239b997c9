//! The set of listening sockets.
//!
//! Built once at startup from configured address strings, read-only while
//! the acceptor runs, closed once at shutdown.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener};

use kmsd_core::{AddressFamily, AddressSpec, DEFAULT_PORT, ResolveHints, family_label};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Upper bound on listeners, the platform's descriptor-set size.
pub const MAX_LISTENERS: usize = libc::FD_SETSIZE as usize;

/// Create a TCP socket listening on `addr`.
///
/// IPv6 sockets are restricted to IPv6 traffic so that an IPv4 listener on
/// the same port can coexist. `SO_REUSEADDR` is enabled and the backlog is
/// `SOMAXCONN`.
///
/// # Errors
///
/// Returns the OS error of the first failing step; the socket is closed.
pub fn listen_on_address(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    Ok(socket.into())
}

/// A bound, listening socket and the address it was bound to.
#[derive(Debug)]
pub struct ListeningSocket {
    listener: TcpListener,
    address: SocketAddr,
}

impl ListeningSocket {
    /// The underlying listener.
    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// The bound address, with the kernel-chosen port when port 0 was
    /// requested.
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Ordered collection of listening sockets.
///
/// Registration order matters: when several listeners are ready at once,
/// the acceptor serves the earliest registered one.
#[derive(Debug)]
pub struct ListenerSet {
    sockets: Vec<ListeningSocket>,
    capacity: usize,
    default_port: u16,
    family: AddressFamily,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

impl ListenerSet {
    /// An empty set holding up to [`MAX_LISTENERS`] sockets.
    pub fn new(default_port: u16) -> Self {
        Self::with_capacity(default_port, MAX_LISTENERS)
    }

    /// An empty set holding up to `capacity` sockets (capped at
    /// [`MAX_LISTENERS`]).
    pub fn with_capacity(default_port: u16, capacity: usize) -> Self {
        Self {
            sockets: Vec::new(),
            capacity: capacity.min(MAX_LISTENERS),
            default_port,
            family: AddressFamily::Any,
        }
    }

    /// Restrict the families accepted from address strings.
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    /// Resolve `address` and listen on every resulting candidate.
    ///
    /// Candidates are bound independently: a failure is logged and skipped.
    /// Once the set is full the remaining candidates are dropped with a
    /// warning. Returns `true` iff at least one socket was added.
    pub fn add_listening_socket(&mut self, address: &str) -> bool {
        let candidates = match AddressSpec::parse(address, self.default_port, self.family)
            .and_then(|spec| spec.resolve(ResolveHints::listen()))
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(address, error = %e, "cannot resolve listen address");
                return false;
            }
        };

        let mut added = false;
        for candidate in candidates {
            if self.sockets.len() >= self.capacity {
                tracing::warn!(
                    address,
                    capacity = self.capacity,
                    "cannot listen on more addresses, listener set is full"
                );
                break;
            }

            match listen_on_address(candidate) {
                Ok(listener) => {
                    let bound = listener.local_addr().unwrap_or(candidate);
                    tracing::info!(address = %bound, "listening");
                    self.sockets.push(ListeningSocket {
                        listener,
                        address: bound,
                    });
                    added = true;
                }
                Err(e) => {
                    tracing::warn!(
                        address = %candidate,
                        family = family_label(&candidate),
                        error = %e,
                        "cannot listen"
                    );
                }
            }
        }
        added
    }

    /// Number of listening sockets.
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Whether no socket is listening.
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Maximum number of sockets this set accepts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Listening sockets in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ListeningSocket> {
        self.sockets.iter()
    }

    /// The socket registered at `index`.
    pub fn get(&self, index: usize) -> Option<&ListeningSocket> {
        self.sockets.get(index)
    }

    /// Bound addresses in registration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().map(|s| s.address).collect()
    }

    /// Shut down and close every socket. Safe to call more than once.
    pub fn close_all(&mut self) {
        for socket in self.sockets.drain(..) {
            // Listening sockets usually report ENOTCONN here; closing is what
            // matters.
            let _ = SockRef::from(&socket.listener).shutdown(Shutdown::Both);
            tracing::debug!(address = %socket.address, "listener closed");
        }
    }
}
