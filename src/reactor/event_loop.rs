//! Reactor event loop.
//!
//! One thread, one multiplexer. Setup binds the listener and registers the
//! acceptor; every turn then waits for readiness and dispatches each ready
//! registration to its handler exactly once. Handlers run to completion one
//! after another and never block, since every socket is non-blocking.
//!
//! The loop stops when its `StopHandle` is triggered (checked between waits)
//! or when the multiplexer itself fails.

use super::acceptor::Acceptor;
use super::connection::{ConnectionHandler, Outcome};
use super::error::ReactorError;
use super::handler::Handler;
use super::multiplexer::{Multiplexer, ReadyEvent};
use crate::config::Config;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Cross-thread stop signal for a running loop.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Ask the loop to exit after the current turn.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Running totals, logged when the loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub accepted: u64,
    pub reads: u64,
    pub bytes_read: u64,
    pub closed: u64,
}

/// Single-threaded reactor.
pub struct ReactorLoop {
    mux: Multiplexer,
    listener_token: Token,
    local_addr: SocketAddr,
    buffer_size: usize,
    ack: Vec<u8>,
    stop: StopHandle,
    stats: Stats,
    /// Accepted during the current batch, registered once it is dispatched.
    pending: Vec<(TcpStream, SocketAddr)>,
}

impl ReactorLoop {
    /// Bind the listener and register the acceptor.
    pub fn bind(config: &Config) -> Result<Self, ReactorError> {
        let listener = create_listener(config.listen, config.backlog)
            .map_err(|e| ReactorError::Bind(config.listen, e))?;
        let acceptor = Acceptor::new(TcpListener::from_std(listener));
        let local_addr = acceptor
            .local_addr()
            .map_err(|e| ReactorError::Bind(config.listen, e))?;

        let mut mux = Multiplexer::new(config.events_capacity).map_err(ReactorError::Setup)?;
        let waker = mux.waker().map_err(ReactorError::Setup)?;
        let listener_token = mux.register(Handler::Acceptor(acceptor), Interest::READABLE)?;

        info!(
            addr = %local_addr,
            buffer_size = config.buffer_size,
            events_capacity = config.events_capacity,
            "Reactor listening"
        );

        Ok(Self {
            mux,
            listener_token,
            local_addr,
            buffer_size: config.buffer_size,
            ack: config.ack.clone(),
            stop: StopHandle {
                stopped: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            stats: Stats::default(),
            pending: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    #[cfg(test)]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Live connection registrations (the listener is not counted).
    pub fn connection_count(&self) -> usize {
        self.mux.len().saturating_sub(1)
    }

    /// Run until stopped or the multiplexer fails.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        let result = loop {
            if self.stop.is_stopped() {
                break Ok(());
            }
            if let Err(e) = self.turn(None) {
                error!(error = %e, "Reactor failed");
                break Err(e);
            }
        };

        self.mux.close();
        info!(
            accepted = self.stats.accepted,
            reads = self.stats.reads,
            bytes_read = self.stats.bytes_read,
            closed = self.stats.closed,
            "Reactor stopped"
        );
        result
    }

    /// One wait and dispatch cycle. Returns the number of events handled.
    ///
    /// An interrupted wait is an empty turn; any other wait failure is fatal.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, ReactorError> {
        let ready = match self.mux.wait(timeout) {
            Ok(ready) => ready,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(ReactorError::Wait(e)),
        };

        debug!(events = ready.len(), "Wait returned");
        for event in &ready {
            self.dispatch(event);
        }
        self.register_pending();
        Ok(ready.len())
    }

    fn dispatch(&mut self, event: &ReadyEvent) {
        // New peers are only registered after the batch, so a token closed
        // earlier in the batch is never reused before its stale events pass.
        let Some(handler) = self.mux.handler_mut(event.token) else {
            trace!(token = event.token.0, "Stale event");
            return;
        };

        match handler {
            Handler::Acceptor(acceptor) => self.pending.extend(acceptor.on_ready()),
            Handler::Connection(conn) => {
                let (reads, bytes_read) = (conn.reads(), conn.bytes_read());
                let outcome = conn.on_ready(event, &self.ack);
                self.stats.reads += conn.reads() - reads;
                self.stats.bytes_read += conn.bytes_read() - bytes_read;

                match outcome {
                    Outcome::Keep(interest) => {
                        if let Err(e) = self.mux.reregister(event.token, interest) {
                            warn!(token = event.token.0, error = %e, "Reregister failed");
                            self.close_connection(event.token);
                        }
                    }
                    Outcome::Close => self.close_connection(event.token),
                }
            }
        }
    }

    fn register_pending(&mut self) {
        for (stream, peer) in std::mem::take(&mut self.pending) {
            self.register_connection(stream, peer);
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let handler = ConnectionHandler::new(stream, peer, self.buffer_size);
        match self
            .mux
            .register(Handler::Connection(handler), Interest::READABLE)
        {
            Ok(token) => {
                self.stats.accepted += 1;
                debug!(
                    token = token.0,
                    peer = %peer,
                    open = self.connection_count(),
                    "Connection registered"
                );
            }
            Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
        }
    }

    fn close_connection(&mut self, token: Token) {
        debug_assert_ne!(token, self.listener_token, "listener is never closed by dispatch");
        if let Some(Handler::Connection(conn)) = self.mux.deregister(token) {
            self.stats.closed += 1;
            debug!(
                token = token.0,
                peer = %conn.peer(),
                reads = conn.reads(),
                state = ?conn.state(),
                open = self.connection_count(),
                "Connection closed"
            );
        }
    }
}

/// Create a non-blocking listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as ClientStream;
    use std::thread;
    use std::time::Instant;

    const ACK: &[u8] = b"ack!";

    fn config(buffer_size: usize) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            buffer_size,
            ack: ACK.to_vec(),
            ..Config::default()
        }
    }

    fn turn_until(reactor: &mut ReactorLoop, mut done: impl FnMut(&ReactorLoop) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(reactor) && Instant::now() < deadline {
            reactor.turn(Some(Duration::from_millis(50))).unwrap();
        }
        assert!(done(reactor), "reactor did not reach expected state");
    }

    fn connect(reactor: &mut ReactorLoop) -> ClientStream {
        let expected = reactor.connection_count() + 1;
        let client = ClientStream::connect(reactor.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        turn_until(reactor, |r| r.connection_count() == expected);
        client
    }

    fn send(reactor: &mut ReactorLoop, client: &mut ClientStream, payload: &[u8]) {
        let expected = reactor.stats().bytes_read + payload.len() as u64;
        client.write_all(payload).unwrap();
        turn_until(reactor, |r| r.stats().bytes_read == expected);
    }

    fn read_ack(client: &mut ClientStream) -> Vec<u8> {
        let mut reply = vec![0u8; ACK.len()];
        client.read_exact(&mut reply).unwrap();
        reply
    }

    /// Nothing beyond what was already read is waiting on the client.
    fn assert_drained(client: &ClientStream) {
        client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];
        let err = (&*client).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        client.set_nonblocking(false).unwrap();
    }

    #[test]
    fn test_ping_scenario() {
        let mut reactor = ReactorLoop::bind(&config(128)).unwrap();
        let mut client = connect(&mut reactor);

        send(&mut reactor, &mut client, b"ping");
        assert_eq!(reactor.stats().reads, 1);
        assert_eq!(read_ack(&mut client), ACK);

        drop(client);
        turn_until(&mut reactor, |r| r.connection_count() == 0);
        assert_eq!(reactor.stats().closed, 1);
        assert_eq!(reactor.stats().accepted, 1);
    }

    #[test]
    fn test_small_message_gets_single_ack() {
        let mut reactor = ReactorLoop::bind(&config(128)).unwrap();
        let mut client = connect(&mut reactor);

        let payload = [b'x'; 128];
        send(&mut reactor, &mut client, &payload);
        assert_eq!(reactor.stats().reads, 1);
        assert_eq!(read_ack(&mut client), ACK);
        assert_drained(&client);
    }

    #[test]
    fn test_oversized_burst_is_split_not_lost() {
        let mut reactor = ReactorLoop::bind(&config(8)).unwrap();
        let mut client = connect(&mut reactor);

        send(&mut reactor, &mut client, b"0123456789abcdef0123");
        assert_eq!(reactor.stats().bytes_read, 20);
        assert_eq!(reactor.stats().reads, 3);

        for _ in 0..3 {
            assert_eq!(read_ack(&mut client), ACK);
        }
        assert_drained(&client);
    }

    #[test]
    fn test_two_clients_are_independent() {
        let mut reactor = ReactorLoop::bind(&config(128)).unwrap();
        let mut a = connect(&mut reactor);
        let mut b = connect(&mut reactor);
        assert_eq!(reactor.connection_count(), 2);

        send(&mut reactor, &mut a, b"from a");
        send(&mut reactor, &mut b, b"from b");

        assert_eq!(read_ack(&mut a), ACK);
        assert_eq!(read_ack(&mut b), ACK);
        assert_drained(&a);
        assert_drained(&b);
    }

    #[test]
    fn test_disconnect_does_not_affect_others() {
        let mut reactor = ReactorLoop::bind(&config(128)).unwrap();
        let a = connect(&mut reactor);
        let mut b = connect(&mut reactor);

        drop(a);
        turn_until(&mut reactor, |r| r.connection_count() == 1);
        assert_eq!(reactor.stats().closed, 1);

        send(&mut reactor, &mut b, b"still here");
        assert_eq!(read_ack(&mut b), ACK);
    }

    fn only_connection(reactor: &ReactorLoop) -> Token {
        let tokens: Vec<Token> = reactor
            .mux
            .tokens()
            .into_iter()
            .filter(|&token| token != reactor.listener_token)
            .collect();
        assert_eq!(tokens.len(), 1);
        tokens[0]
    }

    #[test]
    fn test_large_ack_switches_interest_until_flushed() {
        let big_ack = vec![b'z'; 32 * 1024 * 1024];
        let mut reactor = ReactorLoop::bind(&Config {
            ack: big_ack.clone(),
            ..config(128)
        })
        .unwrap();
        let mut client = connect(&mut reactor);
        let token = only_connection(&reactor);

        client.write_all(b"x").unwrap();
        turn_until(&mut reactor, |r| r.stats().bytes_read == 1);
        assert_eq!(
            reactor.mux.interest(token),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        // Client not reading: the reply stays queued.
        reactor.turn(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(
            reactor.mux.interest(token),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        client.set_nonblocking(true).unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0;
        let deadline = Instant::now() + Duration::from_secs(30);
        while received < big_ack.len() && Instant::now() < deadline {
            match client.read(&mut buf) {
                Ok(0) => panic!("server closed the connection"),
                Ok(n) => {
                    assert!(buf[..n].iter().all(|&b| b == b'z'));
                    received += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    reactor.turn(Some(Duration::from_millis(10))).unwrap();
                }
                Err(e) => panic!("client read failed: {e}"),
            }
        }

        assert_eq!(received, big_ack.len());
        turn_until(&mut reactor, |r| {
            r.mux.interest(token) == Some(Interest::READABLE)
        });
        assert_eq!(reactor.stats().reads, 1);
        assert_eq!(reactor.connection_count(), 1);
    }

    #[test]
    fn test_closed_token_is_not_reused_within_a_batch() {
        let mut reactor = ReactorLoop::bind(&config(128)).unwrap();
        let a = connect(&mut reactor);
        let old = only_connection(&reactor);

        drop(a);
        let _b = ClientStream::connect(reactor.local_addr()).unwrap();

        let hangup = ReadyEvent {
            token: old,
            readable: true,
            writable: false,
            read_closed: true,
            write_closed: false,
            error: false,
        };
        let accept = ReadyEvent {
            token: reactor.listener_token,
            read_closed: false,
            ..hangup
        };

        // Wait for A's FIN so the first dispatch closes it.
        let deadline = Instant::now() + Duration::from_secs(5);
        while reactor.connection_count() == 1 && Instant::now() < deadline {
            reactor.dispatch(&hangup);
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(reactor.connection_count(), 0);

        // Same batch: accept B, then a stale event for A's token.
        reactor.dispatch(&accept);
        reactor.dispatch(&hangup);
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.stats().closed, 1);

        reactor.register_pending();
        assert_eq!(reactor.connection_count(), 1);
        assert_eq!(only_connection(&reactor), old);
        assert_eq!(reactor.stats().accepted, 2);
    }

    #[test]
    fn test_idle_turn_blocks() {
        let mut reactor = ReactorLoop::bind(&config(128)).unwrap();

        let start = Instant::now();
        let handled = reactor.turn(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(handled, 0);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_stop_handle_ends_run() {
        let mut reactor = ReactorLoop::bind(&config(128)).unwrap();
        let addr = reactor.local_addr();
        let stop = reactor.stop_handle();

        let worker = thread::spawn(move || {
            let result = reactor.run();
            (result, reactor.stats())
        });

        let mut client = ClientStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"hello").unwrap();
        assert_eq!(read_ack(&mut client), ACK);

        stop.stop();
        assert!(stop.is_stopped());

        let (result, stats) = worker.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.reads, 1);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let reactor = ReactorLoop::bind(&config(128)).unwrap();
        let taken = Config {
            listen: reactor.local_addr(),
            ..config(128)
        };
        assert!(matches!(
            ReactorLoop::bind(&taken),
            Err(ReactorError::Bind(_, _))
        ));
    }
}
