//! Reactor error types.
//!
//! Only multiplexer-level failures escape the event loop. Accept, read and
//! write failures are handled where they happen and never show up here.

use mio::Token;
use std::io;
use std::net::SocketAddr;

/// Failure to add or modify a registration.
#[derive(Debug)]
pub enum RegistrationError {
    /// The multiplexer has been closed.
    Closed,
    /// No registration exists for this token.
    UnknownToken(Token),
    /// The OS rejected the descriptor (closed or invalid).
    Io(io::Error),
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationError::Closed => write!(f, "multiplexer is closed"),
            RegistrationError::UnknownToken(token) => {
                write!(f, "no registration for token {}", token.0)
            }
            RegistrationError::Io(e) => write!(f, "registration failed: {e}"),
        }
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistrationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegistrationError {
    fn from(e: io::Error) -> Self {
        RegistrationError::Io(e)
    }
}

/// Errors that stop the reactor.
#[derive(Debug)]
pub enum ReactorError {
    /// The listening socket could not be created or bound.
    Bind(SocketAddr, io::Error),
    /// The readiness facility could not be created.
    Setup(io::Error),
    /// Setup-time registration failed.
    Registration(RegistrationError),
    /// The readiness facility failed while waiting.
    Wait(io::Error),
}

impl std::fmt::Display for ReactorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReactorError::Bind(addr, e) => write!(f, "failed to bind {addr}: {e}"),
            ReactorError::Setup(e) => write!(f, "failed to create multiplexer: {e}"),
            ReactorError::Registration(e) => write!(f, "{e}"),
            ReactorError::Wait(e) => write!(f, "multiplexer wait failed: {e}"),
        }
    }
}

impl std::error::Error for ReactorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReactorError::Bind(_, e) | ReactorError::Setup(e) | ReactorError::Wait(e) => Some(e),
            ReactorError::Registration(e) => Some(e),
        }
    }
}

impl From<RegistrationError> for ReactorError {
    fn from(e: RegistrationError) -> Self {
        ReactorError::Registration(e)
    }
}
