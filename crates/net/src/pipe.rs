//! Pipe connections, for child-process stdio wiring and in-process byte
//! channels.
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::stream::StreamIo;
use crate::sys;

/// Which directions a pipe connection supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    /// Both directions over one descriptor (a socketpair end).
    Bidirectional,
    /// Read side of a child's stdout/stderr.
    InputOnly,
    /// Write side of a child's stdin.
    OutputOnly,
}

/// One end of a pipe, usable as the raw stream under a line- or
/// message-framed connection.
///
/// The descriptor is owned and closed on drop.
pub struct PipeEnd {
    fd: OwnedFd,
    mode: PipeMode,
}

impl PipeEnd {
    /// Create a connected bidirectional pair (a Unix socketpair). One end
    /// typically goes to another thread or a child process.
    pub fn pair() -> io::Result<(PipeEnd, PipeEnd)> {
        let (left, right) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;

        Ok((
            Self {
                fd: left,
                mode: PipeMode::Bidirectional,
            },
            Self {
                fd: right,
                mode: PipeMode::Bidirectional,
            },
        ))
    }

    /// Wrap a descriptor we only read from, e.g. a child's stdout.
    pub fn input(fd: OwnedFd) -> io::Result<Self> {
        sys::set_nonblocking(&fd)?;
        Ok(Self {
            fd,
            mode: PipeMode::InputOnly,
        })
    }

    /// Wrap a descriptor we only write to, e.g. a child's stdin.
    pub fn output(fd: OwnedFd) -> io::Result<Self> {
        sys::set_nonblocking(&fd)?;
        Ok(Self {
            fd,
            mode: PipeMode::OutputOnly,
        })
    }

    pub fn mode(&self) -> PipeMode {
        self.mode
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.mode == PipeMode::OutputOnly {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        sys::read(&self.fd, buf)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mode == PipeMode::InputOnly {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        sys::write(&self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for PipeEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl StreamIo for PipeEnd {
    fn wants_read(&self) -> bool {
        self.mode != PipeMode::OutputOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::framing::LineStream;
    use crate::reactor::Reactor;
    use crate::time::LocalDuration;

    #[test]
    fn test_pair_lines_both_ways() {
        let (ours, theirs) = PipeEnd::pair().unwrap();
        let mut reactor = Reactor::new().unwrap();

        let lines = Rc::new(RefCell::new(Vec::new()));
        let seen = lines.clone();

        let conn = Rc::new(RefCell::new(LineStream::new(
            "pipe",
            ours,
            Box::new(move |line, _ctl| {
                seen.borrow_mut().push(line.to_string());
            }),
        )));
        conn.borrow_mut().write_line("down");
        reactor.add(conn.clone()).unwrap();

        // The other side writes to us.
        let mut theirs = theirs;
        theirs.write_all(b"up\n").unwrap();

        for _ in 0..10 {
            reactor.poll(LocalDuration::from_millis(50)).unwrap();
            if !lines.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(*lines.borrow(), vec!["up"]);

        // And our queued line reached them.
        let mut buf = [0u8; 16];
        let n = theirs.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"down\n");
    }

    #[test]
    fn test_modes() {
        let (r, w) = sys::pipe().unwrap();
        let mut input = PipeEnd::input(r).unwrap();
        let mut output = PipeEnd::output(w).unwrap();

        assert!(input.write(b"x").is_err());
        output.write_all(b"hi").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).unwrap(), 2);
        assert!(!output.wants_read());
    }
}
