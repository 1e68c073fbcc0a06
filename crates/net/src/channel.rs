//! Cross-thread connection: the only sanctioned way for another thread to
//! hand work to a reactor.
//!
//! Items travel over a flume channel; a self-pipe makes the reactor's
//! poll wake up when something is queued.
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use flume as chan;
use tracing::debug;

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;
use crate::sys;

/// Sending half, cloneable across threads.
pub struct ChannelSender<T> {
    sender: chan::Sender<T>,
    wake_fd: Arc<OwnedFd>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            wake_fd: self.wake_fd.clone(),
        }
    }
}

impl<T> ChannelSender<T> {
    /// Queue an item and wake the owning reactor.
    pub fn send(&self, item: T) -> Result<(), Error> {
        self.sender
            .send(item)
            .map_err(|_| Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)))?;

        match sys::write(&*self.wake_fd, &[1]) {
            Ok(_) => Ok(()),
            // A full pipe still wakes the reactor.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Receiving half, owned by a reactor.
pub struct ChannelConnection<T> {
    meta: Meta,
    receiver: chan::Receiver<T>,
    pipe_read: OwnedFd,
    on_item: Box<dyn FnMut(T, &mut Control)>,
}

/// Create a connected cross-thread channel pair.
pub fn channel<T>(
    name: impl Into<String>,
    on_item: Box<dyn FnMut(T, &mut Control)>,
) -> Result<(ChannelSender<T>, ChannelConnection<T>), Error> {
    let (sender, receiver) = chan::unbounded();
    let (pipe_read, pipe_write) = sys::pipe()?;

    Ok((
        ChannelSender {
            sender,
            wake_fd: Arc::new(pipe_write),
        },
        ChannelConnection {
            meta: Meta::new(name),
            receiver,
            pipe_read,
            on_item,
        },
    ))
}

impl<T> Connection for ChannelConnection<T> {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.pipe_read.as_raw_fd())
    }

    fn has_pending_work(&self) -> bool {
        !self.receiver.is_empty()
    }

    fn process_read(&mut self, ctl: &mut Control) {
        // Drain the wake bytes, then the queued items under the event
        // budget; leftovers keep the next iteration immediate.
        let mut writers_gone = false;
        let mut buf = [0u8; 64];

        loop {
            match sys::read(&self.pipe_read, &mut buf) {
                Ok(0) => {
                    writers_gone = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        for _ in 0..self.meta.event_limit() {
            match self.receiver.try_recv() {
                Ok(item) => (self.on_item)(item, ctl),
                Err(_) => break,
            }
        }

        if writers_gone && self.receiver.is_empty() {
            debug!(target: "net", "{}: Channel writers are gone", self.meta.name());
            ctl.remove_self();
        }
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
    fn test_items_cross_threads() {
        let mut reactor = Reactor::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();

        let (sender, connection) = channel::<u32>(
            "cross-thread",
            Box::new(move |item, _ctl| log.borrow_mut().push(item)),
        )
        .unwrap();
        reactor.add(Rc::new(RefCell::new(connection))).unwrap();

        let handle = std::thread::spawn(move || {
            for i in 0..10 {
                sender.send(i).unwrap();
            }
        });
        handle.join().unwrap();

        for _ in 0..10 {
            reactor.poll(LocalDuration::from_millis(50)).unwrap();
            if seen.borrow().len() == 10 {
                break;
            }
        }
        assert_eq!(*seen.borrow(), (0..10).collect::<Vec<_>>());
    }
}
