//! Handlers attached to registrations.
//!
//! Each registration carries exactly one handler. The event loop matches on
//! the variant and invokes it once per ready event.

use super::acceptor::Acceptor;
use super::connection::ConnectionHandler;
use mio::event::Source;

/// What runs when a registration becomes ready.
pub enum Handler {
    /// Owns the listening socket; fires on accept-readiness.
    Acceptor(Acceptor),
    /// Owns one accepted peer; fires on read (and pending-write) readiness.
    Connection(ConnectionHandler),
}

impl Handler {
    /// The socket this handler is bound to.
    pub fn source_mut(&mut self) -> &mut dyn Source {
        match self {
            Handler::Acceptor(acceptor) => acceptor.listener_mut(),
            Handler::Connection(conn) => conn.stream_mut(),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Acceptor(_) => "acceptor",
            Handler::Connection(_) => "connection",
        }
    }
}
