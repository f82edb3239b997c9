//! The seam between the server and the protocol engine.

use std::net::TcpStream;

use crate::types::AssociationGroupId;

/// Protocol engine invoked once per accepted connection.
///
/// The handler performs its own framing over `stream` and returns when the
/// exchange is finished, successfully or not. The server owns the stream:
/// it applies the I/O timeouts before the call and closes the stream after
/// the call returns.
///
/// Handlers run on worker threads or in forked children depending on the
/// execution strategy, hence the `Send + Sync + 'static` bound.
///
/// Any `Fn(&mut TcpStream, AssociationGroupId)` closure is a handler.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one connection.
    fn handle(&self, stream: &mut TcpStream, group: AssociationGroupId);
}

impl<F> ConnectionHandler for F
where
    F: Fn(&mut TcpStream, AssociationGroupId) + Send + Sync + 'static,
{
    fn handle(&self, stream: &mut TcpStream, group: AssociationGroupId) {
        self(stream, group)
    }
}
