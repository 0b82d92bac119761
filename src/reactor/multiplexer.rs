//! Readiness multiplexer.
//!
//! Wraps `mio::Poll` (epoll on Linux, kqueue on macOS) together with the
//! registration table. The slab key of a registration is its token, so
//! looking up the handler for a ready event is O(1).
//!
//! All mutation happens on the reactor thread, either before `wait` or while
//! the loop walks the events `wait` returned. There is no locking.

use super::error::RegistrationError;
use super::handler::Handler;
use mio::event::Event;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::time::Duration;
use tracing::debug;

/// Reserved for the stop waker; never handed out by the slab in practice.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// One ready registration as reported by a single `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl ReadyEvent {
    /// Peer hung up or the socket reported an error.
    pub fn is_hangup(&self) -> bool {
        self.read_closed || self.write_closed || self.error
    }
}

impl From<&Event> for ReadyEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// A monitored socket, its interest mask and the handler attached to it.
pub struct Registration {
    interest: Interest,
    handler: Handler,
}

/// Owner of the poll instance and every registration.
pub struct Multiplexer {
    /// `None` once closed.
    poll: Option<Poll>,
    events: Events,
    registrations: Slab<Registration>,
}

impl Multiplexer {
    /// Create a multiplexer returning at most `events_capacity` events per wait.
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Some(Poll::new()?),
            events: Events::with_capacity(events_capacity),
            registrations: Slab::new(),
        })
    }

    /// Add a registration. The handler's socket is moved into the table, so
    /// the same socket can never be registered twice.
    ///
    /// On failure nothing is inserted and the handler (with its socket) is
    /// dropped. Handlers only ever hold sockets, so the OS rejecting the
    /// descriptor takes a socket that cannot be polled at all.
    pub fn register(
        &mut self,
        mut handler: Handler,
        interest: Interest,
    ) -> Result<Token, RegistrationError> {
        let poll = self.poll.as_ref().ok_or(RegistrationError::Closed)?;

        let entry = self.registrations.vacant_entry();
        let token = Token(entry.key());
        poll.registry()
            .register(handler.source_mut(), token, interest)?;

        debug!(token = token.0, kind = handler.kind(), ?interest, "Registered");
        entry.insert(Registration { interest, handler });
        Ok(token)
    }

    /// Replace the interest mask of an existing registration.
    pub fn reregister(&mut self, token: Token, interest: Interest) -> Result<(), RegistrationError> {
        let poll = self.poll.as_ref().ok_or(RegistrationError::Closed)?;
        let registration = self
            .registrations
            .get_mut(token.0)
            .ok_or(RegistrationError::UnknownToken(token))?;

        if registration.interest != interest {
            poll.registry()
                .reregister(registration.handler.source_mut(), token, interest)?;
            registration.interest = interest;
        }
        Ok(())
    }

    /// Remove a registration. Dropping the returned handler closes its socket.
    pub fn deregister(&mut self, token: Token) -> Option<Handler> {
        let mut registration = self.registrations.try_remove(token.0)?;
        if let Some(poll) = &self.poll {
            if let Err(e) = poll.registry().deregister(registration.handler.source_mut()) {
                debug!(token = token.0, error = %e, "Deregister failed");
            }
        }
        Some(registration.handler)
    }

    /// Block until at least one registration is ready.
    ///
    /// Returns early with fewer (possibly zero) events only when `timeout`
    /// elapses or a waker fires. Facility errors are returned as-is.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let poll = self
            .poll
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "multiplexer is closed"))?;

        poll.poll(&mut self.events, timeout)?;

        Ok(self
            .events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(ReadyEvent::from)
            .collect())
    }

    /// Create a waker that interrupts `wait` from another thread.
    pub fn waker(&self) -> io::Result<Waker> {
        let poll = self
            .poll
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "multiplexer is closed"))?;
        Waker::new(poll.registry(), WAKER_TOKEN)
    }

    pub fn handler_mut(&mut self, token: Token) -> Option<&mut Handler> {
        self.registrations
            .get_mut(token.0)
            .map(|registration| &mut registration.handler)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Release the poll instance and every registration. Idempotent.
    pub fn close(&mut self) {
        let Some(poll) = self.poll.take() else {
            return;
        };

        let count = self.registrations.len();
        for (key, registration) in self.registrations.iter_mut() {
            if let Err(e) = poll.registry().deregister(registration.handler.source_mut()) {
                debug!(token = key, error = %e, "Deregister failed");
            }
        }
        self.registrations.clear();
        debug!(registrations = count, "Multiplexer closed");
    }

    #[cfg(test)]
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.registrations
            .get(token.0)
            .map(|registration| registration.interest)
    }

    #[cfg(test)]
    pub fn tokens(&self) -> Vec<Token> {
        self.registrations.iter().map(|(key, _)| Token(key)).collect()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.poll.is_none()
    }
}
