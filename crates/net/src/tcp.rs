//! TCP listener and non-blocking dialing.
use std::io;
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time;

use tracing::{debug, error, trace};

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;
use crate::time::LocalTime;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 25;

/// Maximum time to wait when reading from a socket.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(6);
/// Maximum time to wait when writing to a socket.
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(3);

/// Called for every accepted stream.
pub type AcceptFn = Box<dyn FnMut(net::TcpStream, SocketAddr, &mut Control)>;

/// Listening TCP socket. Each readiness drains pending connections, up to
/// the connection's event budget, and hands them to the accept callback.
pub struct TcpServer {
    meta: Meta,
    listener: net::TcpListener,
    on_accept: AcceptFn,
}

impl TcpServer {
    /// Bind a non-blocking listener on `addr`.
    pub fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        backlog: i32,
        on_accept: AcceptFn,
    ) -> Result<Self, Error> {
        let listener = listen(addr, backlog)?;

        Ok(Self {
            meta: Meta::new(name),
            listener,
            on_accept,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Connection for TcpServer {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
    }

    fn want_listen(&self) -> bool {
        true
    }

    fn process_accept(&mut self, ctl: &mut Control) {
        let deadline = LocalTime::now() + self.meta.processing_budget();

        for _ in 0..self.meta.event_limit() {
            if LocalTime::now() >= deadline {
                break;
            }
            let (conn, addr) = match self.listener.accept() {
                Ok((conn, addr)) => (conn, addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(target: "net", "{}: Accept error: {}", self.meta.name(), err);
                    break;
                }
            };

            trace!(target: "net", "{}: Accepting connection from {}", self.meta.name(), addr);

            if let Err(err) = conn.set_nonblocking(true) {
                debug!(target: "net", "{}: Cannot make {} non-blocking: {}", self.meta.name(), addr, err);
                continue;
            }
            (self.on_accept)(conn, addr, ctl);
        }
    }
}

/// Listen for connections on the given address with an explicit backlog.
fn listen(addr: SocketAddr, backlog: i32) -> Result<net::TcpListener, Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    sock.set_nonblocking(true)?;

    Ok(sock.into())
}

/// Connect to a peer given a remote address, without blocking.
///
/// The connection is established once the socket reports writability.
pub fn dial(addr: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    sock.set_write_timeout(Some(WRITE_TIMEOUT))?;
    sock.set_nonblocking(true)?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::reactor::Reactor;
    use crate::time::LocalDuration;

    #[test]
    fn test_accept_drains_up_to_budget() {
        let mut reactor = Reactor::new().unwrap();
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let log = accepted.clone();

        let server = TcpServer::bind(
            "listener",
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_BACKLOG,
            Box::new(move |_conn, addr, _ctl| log.borrow_mut().push(addr)),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();

        reactor.add(Rc::new(RefCell::new(server))).unwrap();

        let _clients: Vec<_> = (0..3).map(|_| net::TcpStream::connect(addr).unwrap()).collect();

        // Give the kernel a beat, then poll a few iterations.
        for _ in 0..10 {
            reactor.poll(LocalDuration::from_millis(50)).unwrap();
            if accepted.borrow().len() == 3 {
                break;
            }
        }
        assert_eq!(accepted.borrow().len(), 3);
    }

    #[test]
    fn test_dial_connects() {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = dial(&addr).unwrap();

        let (accepted, _) = listener.accept().unwrap();
        assert_eq!(
            accepted.peer_addr().unwrap().ip(),
            stream.local_addr().unwrap().ip()
        );
    }
}
