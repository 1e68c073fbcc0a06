//! Datagram message endpoints: UDP and Unix-datagram.
//!
//! One datagram carries one message in the text wire format without a
//! trailing newline, and must fit [`MAX_DATAGRAM`] bytes. Sending is
//! synchronous and lossy by design.
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

use tracing::{debug, warn};

use courier_types::{Endpoint, Message};

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;

/// Largest accepted datagram payload.
pub const MAX_DATAGRAM: usize = 1024;

/// Parameter carrying the shared secret.
const SECRET_CODE: &str = "secret_code";

/// A bound datagram socket of either family.
pub enum DgramSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl DgramSocket {
    /// Bind to the given endpoint.
    pub fn bind(endpoint: &Endpoint) -> Result<Self, Error> {
        match endpoint {
            Endpoint::Ip(addr) => {
                let socket = UdpSocket::bind(addr)?;

                socket.set_nonblocking(true)?;
                Ok(Self::Udp(socket))
            }
            Endpoint::Unix {
                path,
                abstract_ns: false,
                unnamed: false,
            } => {
                if path.exists() {
                    std::fs::remove_file(path).ok();
                }
                let socket = UnixDatagram::bind(path)?;

                socket.set_nonblocking(true)?;
                Ok(Self::Unix(socket))
            }
            Endpoint::Unix { .. } => Err(Error::Unsupported(
                "abstract and unnamed unix sockets cannot be bound",
            )),
        }
    }

    /// An unbound socket of the family matching `target`, for one-shot
    /// sends.
    fn unbound_for(target: &Endpoint) -> Result<Self, Error> {
        match target {
            Endpoint::Ip(addr) => {
                let local: SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse().expect("fixed address")
                } else {
                    "[::]:0".parse().expect("fixed address")
                };
                Ok(Self::Udp(UdpSocket::bind(local)?))
            }
            Endpoint::Unix { .. } => Ok(Self::Unix(UnixDatagram::unbound()?)),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => socket.recv_from(buf).map(|(n, _)| n),
            Self::Unix(socket) => socket.recv_from(buf).map(|(n, _)| n),
        }
    }

    fn send_to(&self, buf: &[u8], target: &Endpoint) -> Result<usize, Error> {
        match (self, target) {
            (Self::Udp(socket), Endpoint::Ip(addr)) => Ok(socket.send_to(buf, addr)?),
            (
                Self::Unix(socket),
                Endpoint::Unix {
                    path,
                    abstract_ns: false,
                    ..
                },
            ) => Ok(socket.send_to(buf, path)?),
            _ => Err(Error::Unsupported("datagram family mismatch")),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Udp(socket) => socket.as_raw_fd(),
            Self::Unix(socket) => socket.as_raw_fd(),
        }
    }
}

/// Datagram message endpoint with optional shared-secret authentication.
///
/// Each readiness drains all pending datagrams. A datagram that fails the
/// secret check is dropped; the authorization failure is logged, never
/// answered.
pub struct DgramServer {
    meta: Meta,
    socket: DgramSocket,
    secret: Option<String>,
    on_message: Box<dyn FnMut(Message, &mut Control)>,
}

impl DgramServer {
    pub fn bind(
        name: impl Into<String>,
        endpoint: &Endpoint,
        secret: Option<String>,
        on_message: Box<dyn FnMut(Message, &mut Control)>,
    ) -> Result<Self, Error> {
        Ok(Self {
            meta: Meta::new(name),
            socket: DgramSocket::bind(endpoint)?,
            secret,
            on_message,
        })
    }

    fn check_secret(&self, msg: &Message) -> bool {
        match (&self.secret, msg.parameter(SECRET_CODE)) {
            (Some(expected), Some(code)) => {
                if code == expected {
                    true
                } else {
                    debug!(target: "net", "{}: Dropping {} with wrong secret code", self.meta.name(), msg.command());
                    false
                }
            }
            (Some(_), None) => {
                debug!(target: "net", "{}: Dropping {} without secret code", self.meta.name(), msg.command());
                false
            }
            (None, Some(_)) => {
                // Mixed-secret deployment; accepted with a warning.
                warn!(target: "net", "{}: Received a secret code but none is configured", self.meta.name());
                true
            }
            (None, None) => true,
        }
    }
}

impl Connection for DgramServer {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.raw_fd())
    }

    fn process_read(&mut self, ctl: &mut Control) {
        // Drain all pending datagrams in one step.
        loop {
            let mut buf = [0u8; MAX_DATAGRAM + 1];

            let count = match self.socket.recv(&mut buf) {
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(target: "net", "{}: Receive error: {}", self.meta.name(), err);
                    break;
                }
            };
            if count > MAX_DATAGRAM {
                warn!(target: "net", "{}: Dropping oversize datagram ({} bytes)", self.meta.name(), count);
                continue;
            }

            let text = match std::str::from_utf8(&buf[..count]) {
                Ok(text) => text,
                Err(_) => {
                    warn!(target: "net", "{}: Dropping non-utf8 datagram", self.meta.name());
                    continue;
                }
            };
            let mut msg = match Message::parse(text) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(target: "net", "{}: Dropping invalid datagram: {}", self.meta.name(), err);
                    continue;
                }
            };

            if !self.check_secret(&msg) {
                continue;
            }
            msg.remove_parameter(SECRET_CODE);

            (self.on_message)(msg, ctl);
        }
    }
}

/// Send one message as a datagram, stamping the secret when one is
/// configured. Payloads over [`MAX_DATAGRAM`] bytes are refused.
pub fn send_message(target: &Endpoint, msg: &Message, secret: Option<&str>) -> Result<(), Error> {
    let mut msg = msg.clone();

    if let Some(secret) = secret {
        msg.set_parameter(SECRET_CODE, secret);
    }

    let line = msg.to_text()?;
    if line.len() > MAX_DATAGRAM {
        return Err(Error::MessageTooLarge(line.len(), MAX_DATAGRAM));
    }

    let socket = DgramSocket::unbound_for(target)?;
    socket.send_to(line.as_bytes(), target)?;

    Ok(())
}
