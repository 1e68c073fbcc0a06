//! Reactor and transport errors.

use std::io;

use thiserror::Error;

use courier_types::MessageError;

/// An error occurring in the reactor or one of its connections.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The connection already belongs to a reactor.
    #[error("connection {0:?} is already attached to a reactor")]
    AlreadyAttached(String),

    /// A datagram payload exceeded the transport limit.
    #[error("message too large: {0} bytes over a {1} byte datagram")]
    MessageTooLarge(usize, usize),

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The requested transport feature is not available.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A dispatcher match expression did not compile.
    #[error("invalid match pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A broken invariant, e.g. two always-matches in one dispatcher.
    #[error("implementation error: {0}")]
    Implementation(&'static str),
}
