//! Per-connection read handler.
//!
//! Every read cycle fills at most one fixed-capacity buffer, logs what
//! arrived and queues the acknowledgment. Nothing is reassembled across
//! reads; a message longer than the buffer spans several cycles and gets
//! one acknowledgment per cycle.
//!
//! Writes go through an outbound queue. Whatever the socket does not take
//! immediately stays queued and the handler asks for write-readiness until
//! the queue is empty.

use super::multiplexer::ReadyEvent;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, info};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered, nothing read yet.
    Accepted,
    /// At least one read cycle completed.
    Readable,
    /// Terminal. No further I/O is attempted.
    Closed,
}

/// What the event loop should do with the registration after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the registration with this interest mask.
    Keep(Interest),
    /// Deregister and drop the socket.
    Close,
}

/// Handler bound to one accepted peer.
pub struct ConnectionHandler {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    read_buf: Box<[u8]>,
    outbound: BytesMut,
    reads: u64,
    bytes_read: u64,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
            read_buf: vec![0u8; buffer_size].into_boxed_slice(),
            outbound: BytesMut::new(),
            reads: 0,
            bytes_read: 0,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Completed read cycles.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Handle one readiness event for this connection.
    pub fn on_ready(&mut self, event: &ReadyEvent, ack: &[u8]) -> Outcome {
        if self.state == ConnState::Closed {
            return Outcome::Close;
        }

        if event.writable {
            if let Err(e) = self.flush() {
                debug!(peer = %self.peer, error = %e, "Write failed");
                return self.close();
            }
        }

        // A hang-up is confirmed by the read returning 0 or an error.
        if event.readable || event.is_hangup() {
            match self.read_cycles(ack) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(peer = %self.peer, "Peer closed connection");
                    return self.close();
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Read failed");
                    return self.close();
                }
            }
        }

        if self.outbound.is_empty() {
            Outcome::Keep(Interest::READABLE)
        } else {
            Outcome::Keep(Interest::READABLE | Interest::WRITABLE)
        }
    }

    /// Read until the socket would block. Returns `false` on EOF.
    fn read_cycles(&mut self, ack: &[u8]) -> io::Result<bool> {
        loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.state = ConnState::Readable;
                    self.reads += 1;
                    self.bytes_read += n as u64;
                    info!(
                        peer = %self.peer,
                        bytes = n,
                        payload = %String::from_utf8_lossy(&self.read_buf[..n]),
                        "Received data"
                    );
                    self.outbound.extend_from_slice(ack);
                    self.flush()?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of the outbound queue as the socket accepts.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Outcome {
        self.state = ConnState::Closed;
        self.outbound.clear();
        Outcome::Close
    }
}
