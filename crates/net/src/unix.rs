//! Unix-domain stream transport.
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use tracing::{debug, error, trace};

use courier_types::Endpoint;

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;
use crate::time::LocalTime;

/// Called for every accepted stream.
pub type AcceptFn = Box<dyn FnMut(UnixStream, &mut Control)>;

/// Listening Unix-stream socket.
///
/// A stale socket file left behind by a previous run is removed before
/// binding.
pub struct UnixServer {
    meta: Meta,
    listener: UnixListener,
    on_accept: AcceptFn,
}

impl UnixServer {
    pub fn bind(
        name: impl Into<String>,
        endpoint: &Endpoint,
        on_accept: AcceptFn,
    ) -> Result<Self, Error> {
        let path = unix_path(endpoint)?;

        if path.exists() {
            std::fs::remove_file(path).ok();
        }
        let listener = UnixListener::bind(path)?;

        listener.set_nonblocking(true)?;

        Ok(Self {
            meta: Meta::new(name),
            listener,
            on_accept,
        })
    }
}

impl Connection for UnixServer {
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
            let (conn, _) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(target: "net", "{}: Accept error: {}", self.meta.name(), err);
                    break;
                }
            };

            trace!(target: "net", "{}: Accepting local connection", self.meta.name());

            if let Err(err) = conn.set_nonblocking(true) {
                debug!(target: "net", "{}: Cannot make socket non-blocking: {}", self.meta.name(), err);
                continue;
            }
            (self.on_accept)(conn, ctl);
        }
    }
}

/// Connect to a local Unix-stream endpoint.
pub fn dial(endpoint: &Endpoint) -> Result<UnixStream, Error> {
    let stream = UnixStream::connect(unix_path(endpoint)?)?;

    stream.set_nonblocking(true)?;
    Ok(stream)
}

fn unix_path(endpoint: &Endpoint) -> Result<&Path, Error> {
    match endpoint {
        Endpoint::Unix {
            path,
            abstract_ns: false,
            unnamed: false,
        } => Ok(path),
        Endpoint::Unix { .. } => Err(Error::Unsupported(
            "abstract and unnamed unix sockets cannot be bound",
        )),
        Endpoint::Ip(_) => Err(Error::Unsupported("not a unix endpoint")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::reactor::Reactor;
    use crate::time::LocalDuration;

    #[test]
    fn test_bind_and_accept() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::unix(dir.path().join("courier.sock"));

        let mut reactor = Reactor::new().unwrap();
        let accepted = Rc::new(RefCell::new(0));
        let count = accepted.clone();

        let server = UnixServer::bind(
            "unix listener",
            &endpoint,
            Box::new(move |_conn, _ctl| *count.borrow_mut() += 1),
        )
        .unwrap();
        reactor.add(Rc::new(RefCell::new(server))).unwrap();

        let _client = dial(&endpoint).unwrap();

        for _ in 0..10 {
            reactor.poll(LocalDuration::from_millis(50)).unwrap();
            if *accepted.borrow() == 1 {
                break;
            }
        }
        assert_eq!(*accepted.borrow(), 1);
    }

    #[test]
    fn test_rejects_abstract() {
        let endpoint = Endpoint::parse("@courier", 0).unwrap();

        assert!(matches!(
            UnixServer::bind("x", &endpoint, Box::new(|_, _| {})),
            Err(Error::Unsupported(_))
        ));
    }
}
