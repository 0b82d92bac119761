//! Accept handler for the listening socket.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Handler bound to the listening socket.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept every pending connection.
    ///
    /// Readiness is edge-triggered, so this drains until `accept` would
    /// block. Accepted streams are already non-blocking. An accept error
    /// ends this dispatch and is only logged.
    pub fn on_ready(&mut self) -> Vec<(TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Client connected");
                    accepted.push((stream, peer));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
        accepted
    }
}
