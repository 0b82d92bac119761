//! Single-threaded readiness reactor.
//!
//! Components, leaves first:
//! - `Multiplexer`: mio poll instance plus the registration table
//! - `Acceptor`: accepts peers on the listening socket
//! - `ConnectionHandler`: reads, logs and acknowledges one peer
//! - `ReactorLoop`: waits and dispatches each ready registration
//!
//! Handlers are a tagged `Handler` enum attached to each registration, so
//! dispatch is a plain `match` with one call per ready event.

mod acceptor;
mod connection;
mod error;
mod event_loop;
mod handler;
mod multiplexer;

pub use event_loop::{ReactorLoop, StopHandle};
