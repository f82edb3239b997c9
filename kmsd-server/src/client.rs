//! Outbound connection helpers sharing the address rules of the listener.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use kmsd_core::{AddressError, AddressFamily, AddressSpec, ResolveHints, family_label};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

/// Connect and I/O timeout of outbound connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from [`connect_to_address`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The address string could not be parsed or resolved.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Every candidate refused or timed out. Carries the last failure.
    #[error("cannot connect to {address}: {source}")]
    Connect {
        /// The address string.
        address: String,
        /// The last candidate's error.
        #[source]
        source: io::Error,
    },
}

/// Connect to the first reachable candidate of `address`.
///
/// Candidates are tried in resolver order with [`CONNECT_TIMEOUT`]; the
/// returned stream carries the same value as read and write timeout.
///
/// # Errors
///
/// See [`ConnectError`].
pub fn connect_to_address(
    address: &str,
    family: AddressFamily,
    default_port: u16,
) -> Result<TcpStream, ConnectError> {
    let candidates = AddressSpec::parse(address, default_port, family)?
        .resolve(ResolveHints::connect())?;

    let mut last_error = None;
    for candidate in candidates {
        match connect_candidate(candidate) {
            Ok(stream) => {
                tracing::debug!(
                    address = %candidate,
                    family = family_label(&candidate),
                    "connected"
                );
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(address = %candidate, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(ConnectError::Connect {
        address: address.to_owned(),
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no candidate address")),
    })
}

fn connect_candidate(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
    Ok(stream)
}

/// Whether the peer has closed `stream`.
///
/// Peeks without blocking: end of stream or a reset means disconnected,
/// pending data or nothing to read yet means still connected.
pub fn is_disconnected(stream: &TcpStream) -> bool {
    if let Err(e) = stream.set_nonblocking(true) {
        tracing::debug!(error = %e, "cannot check connection state");
        return true;
    }
    let mut peek_buf = [0u8; 1];
    let disconnected = match stream.peek(&mut peek_buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ),
    };
    if let Err(e) = stream.set_nonblocking(false) {
        tracing::debug!(error = %e, "cannot restore blocking mode");
    }
    disconnected
}

/// Whether this host can create TCP sockets of `family`.
///
/// [`AddressFamily::Any`] needs either stack.
pub fn check_protocol_stack(family: AddressFamily) -> bool {
    let can_open = |domain: Domain| Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).is_ok();
    match family {
        AddressFamily::Ipv4 => can_open(Domain::IPV4),
        AddressFamily::Ipv6 => can_open(Domain::IPV6),
        AddressFamily::Any => can_open(Domain::IPV4) || can_open(Domain::IPV6),
    }
}
