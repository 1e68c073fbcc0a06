//! Signal connection backed by a signalfd.
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{debug, trace};

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;

/// Delivers process signals through the reactor.
///
/// The listed signals are blocked for the calling thread and read from a
/// signalfd instead, so they arrive as ordinary readiness events in the
/// reactor's total order.
pub struct SignalConnection {
    meta: Meta,
    fd: SignalFd,
    on_signal: Box<dyn FnMut(Signal, &mut Control)>,
}

impl SignalConnection {
    pub fn new(
        name: impl Into<String>,
        signals: &[Signal],
        on_signal: Box<dyn FnMut(Signal, &mut Control)>,
    ) -> Result<Self, Error> {
        let mut mask = SigSet::empty();

        for signal in signals {
            mask.add(*signal);
        }
        mask.thread_block()
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;

        Ok(Self {
            meta: Meta::new(name),
            fd,
            on_signal,
        })
    }
}

impl Connection for SignalConnection {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_fd().as_raw_fd())
    }

    fn want_signal(&self) -> bool {
        true
    }

    fn process_signal(&mut self, ctl: &mut Control) {
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => {
                    let Ok(signal) = Signal::try_from(info.ssi_signo as i32) else {
                        debug!(target: "net", "{}: Unknown signal number {}", self.meta.name(), info.ssi_signo);
                        continue;
                    };

                    trace!(target: "net", "{}: Received {}", self.meta.name(), signal);
                    (self.on_signal)(signal, ctl);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(target: "net", "{}: Signal read error: {}", self.meta.name(), err);
                    break;
                }
            }
        }
    }
}
