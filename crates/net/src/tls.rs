//! Seam for an external TLS provider.
//!
//! Transport encryption is delegated: a provider wraps an established
//! stream and exposes the same byte-level contract, surfacing its
//! asynchronous handshake states through the `wants_*` interest hooks.
//! No provider is bundled.
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::stream::StreamIo;

/// An external TLS implementation over an established stream.
///
/// `read`/`write` follow the usual non-blocking contract; while the
/// handshake is in flight the provider reports the directions it needs
/// through [`TlsProvider::wants_read`] and [`TlsProvider::wants_write`].
/// Provider failures surface as ordinary I/O errors and end the
/// connection through `process_error`.
pub trait TlsProvider: Read + Write + AsRawFd {
    /// The provider needs the socket readable (e.g. mid-handshake).
    fn wants_read(&self) -> bool {
        true
    }

    /// The provider needs the socket writable (e.g. mid-handshake).
    fn wants_write(&self) -> bool {
        false
    }
}

/// Type-erased provider stream, usable under any framed connection.
pub struct TlsStream(Box<dyn TlsProvider>);

impl TlsStream {
    pub fn new(provider: Box<dyn TlsProvider>) -> Self {
        Self(provider)
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl AsRawFd for TlsStream {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl StreamIo for TlsStream {
    fn wants_read(&self) -> bool {
        self.0.wants_read()
    }

    fn wants_write(&self) -> bool {
        self.0.wants_write()
    }
}

/// Builds providers for accepted server-side streams.
pub trait TlsAcceptor {
    /// Wrap an accepted stream; called once per connection.
    fn accept(&mut self, stream: std::net::TcpStream) -> io::Result<TlsStream>;
}
