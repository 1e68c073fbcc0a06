//! File watcher connection backed by inotify.
use std::collections::HashMap;
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tracing::{debug, trace};

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;

/// Watches files and directories for changes.
pub struct FileWatcher {
    meta: Meta,
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, PathBuf>,
    on_event: Box<dyn FnMut(&Path, AddWatchFlags, &mut Control)>,
}

impl FileWatcher {
    pub fn new(
        name: impl Into<String>,
        on_event: Box<dyn FnMut(&Path, AddWatchFlags, &mut Control)>,
    ) -> Result<Self, Error> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;

        Ok(Self {
            meta: Meta::new(name),
            inotify,
            watches: HashMap::new(),
            on_event,
        })
    }

    /// Watch a path for the given events.
    pub fn watch(&mut self, path: impl Into<PathBuf>, flags: AddWatchFlags) -> Result<(), Error> {
        let path = path.into();
        let descriptor = self
            .inotify
            .add_watch(&path, flags)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;

        trace!(target: "net", "{}: Watching {}", self.meta.name(), path.display());
        self.watches.insert(descriptor, path);
        Ok(())
    }
}

impl Connection for FileWatcher {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.inotify.as_fd().as_raw_fd())
    }

    fn process_read(&mut self, ctl: &mut Control) {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => return,
            Err(err) => {
                debug!(target: "net", "{}: Watch read error: {}", self.meta.name(), err);
                return;
            }
        };

        for event in events {
            let Some(path) = self.watches.get(&event.wd) else {
                continue;
            };
            let full = match &event.name {
                Some(file) => path.join(file),
                None => path.clone(),
            };

            (self.on_event)(&full, event.mask, ctl);
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
    fn test_modification_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("services");
        std::fs::write(&file, "a\n").unwrap();

        let mut reactor = Reactor::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();

        let mut watcher = FileWatcher::new(
            "watch",
            Box::new(move |path, _mask, _ctl| {
                log.borrow_mut().push(path.to_path_buf());
            }),
        )
        .unwrap();
        watcher
            .watch(dir.path(), AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_CREATE)
            .unwrap();
        reactor.add(Rc::new(RefCell::new(watcher))).unwrap();

        std::fs::write(&file, "a\nb\n").unwrap();

        for _ in 0..10 {
            reactor.poll(LocalDuration::from_millis(50)).unwrap();
            if !seen.borrow().is_empty() {
                break;
            }
        }
        assert!(seen.borrow().iter().any(|p| p == &file));
    }
}
