//! Daemon errors.

use std::io;

use thiserror::Error;

use courier_types::MessageError;

/// An error raised while configuring or running the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A reactor or transport error.
    #[error(transparent)]
    Net(#[from] courier_net::Error),

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// An option was missing or out of range; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}
