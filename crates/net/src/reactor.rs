//! Poll-based reactor. This is a single-threaded reactor using a `poll`
//! loop; it owns a heterogeneous arena of connections and drives them
//! through their readiness, timeout and lifecycle callbacks.
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::{fmt, io};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::connection::{Connection, ConnectionId, ConnectionRef, Control, Op};
use crate::error::Error;
use crate::time::{LocalDuration, LocalTime, TimeoutManager};

/// Maximum amount of time to wait for i/o in one iteration.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);

/// Reserved id for the reactor's own wake-up source.
const WAKER_ID: ConnectionId = ConnectionId(0);

/// Raw descriptor wrapper for source registration.
struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Wakes the reactor from another thread.
#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    /// Wake up! Call this after handing work to a cross-thread connection
    /// so it is processed in a timely fashion.
    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// Readiness flags collected for one connection in one iteration.
#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    error: bool,
    hangup: bool,
    invalid: bool,
    readable: bool,
    writable: bool,
}

/// Which callback to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deliver {
    Error,
    Hup,
    Invalid,
    Read,
    Write,
    Accept,
    Signal,
    Timeout,
}

/// A single-threaded non-blocking reactor.
///
/// All connections owned by one reactor observe a total order of
/// callbacks. The only blocking call is the poll at the top of each
/// iteration; everything else is non-blocking and re-entered on the next
/// readiness.
pub struct Reactor {
    connections: HashMap<ConnectionId, ConnectionRef>,
    /// Descriptor registered per connection, to track fd changes.
    registered: HashMap<ConnectionId, RawFd>,
    sources: popol::Sources<ConnectionId>,
    timeouts: TimeoutManager<ConnectionId>,
    waker: Waker,
    pending: Vec<Op>,
    next_id: u64,
    quit: bool,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("connections", &self.connections.len())
            .finish()
    }
}

thread_local! {
    static INSTANCE: RefCell<Option<Rc<RefCell<Reactor>>>> = const { RefCell::new(None) };
}

impl Reactor {
    /// Construct a new reactor.
    pub fn new() -> Result<Self, Error> {
        let mut sources = popol::Sources::new();
        let waker = Waker(Arc::new(popol::Waker::new(&mut sources, WAKER_ID)?));

        Ok(Self {
            connections: HashMap::new(),
            registered: HashMap::new(),
            sources,
            timeouts: TimeoutManager::new(),
            waker,
            pending: Vec::new(),
            next_id: 1,
            quit: false,
        })
    }

    /// The reactor owned by the current thread.
    ///
    /// Connections belong to exactly one reactor; a multi-reactor process
    /// gives each thread its own instance and crosses between them with
    /// channel connections. Most code should take a reactor explicitly and
    /// reach for the instance only at entry points.
    pub fn instance() -> Rc<RefCell<Reactor>> {
        INSTANCE.with(|instance| {
            instance
                .borrow_mut()
                .get_or_insert_with(|| {
                    Rc::new(RefCell::new(
                        Reactor::new().expect("reactor initialization failed"),
                    ))
                })
                .clone()
        })
    }

    /// Return a new waker for this reactor's poll loop.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of the current connections.
    pub fn list(&self) -> Vec<(ConnectionId, String)> {
        let mut connections: Vec<_> = self
            .connections
            .iter()
            .map(|(id, conn)| (*id, conn.borrow().meta().name().to_string()))
            .collect();

        connections.sort_by_key(|(id, _)| *id);
        connections
    }

    /// Look up an attached connection.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionRef> {
        self.connections.get(&id).cloned()
    }

    /// Attach a connection. Fails if it already belongs to a reactor.
    pub fn add(&mut self, conn: ConnectionRef) -> Result<ConnectionId, Error> {
        let id = ConnectionId(self.next_id);

        self.next_id += 1;
        self.attach(id, conn)?;
        self.flush_ops();

        Ok(id)
    }

    /// Detach a connection at the end of the current (or next) iteration.
    /// Idempotent.
    pub fn remove(&mut self, id: ConnectionId) {
        self.pending.push(Op::Remove(id));
    }

    /// Ask the reactor to stop after the current iteration.
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Detach every connection, in reverse attachment order.
    pub fn clear(&mut self) {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();

        ids.sort_by_key(|id| Reverse(*id));
        for id in ids {
            self.pending.push(Op::Remove(id));
        }
        self.flush_ops();
    }

    /// Run until no connections remain, quit is requested, or the
    /// cancellation token fires.
    pub async fn run(&mut self, cancellation: CancellationToken) -> Result<(), Error> {
        loop {
            self.flush_ops();

            if self.quit || self.connections.is_empty() {
                trace!(target: "reactor", "Reactor done ({} connection(s) left)", self.connections.len());
                break;
            }

            select! {
                _ = cancellation.cancelled() => {
                    trace!(target: "reactor", "Reactor cancelled");
                    break;
                }
                result = self.step() => {
                    result?;
                }
            }
        }
        Ok(())
    }

    async fn step(&mut self) -> Result<(), Error> {
        tokio::task::yield_now().await;
        self.poll(WAIT_TIMEOUT)
    }

    /// Perform one reactor iteration, waiting at most `max_wait` for
    /// readiness.
    pub fn poll(&mut self, max_wait: LocalDuration) -> Result<(), Error> {
        self.flush_ops();

        let now = LocalTime::now();
        let mut immediate = false;

        // Build the interest list, purge finished connections, and keep
        // descriptor registrations in sync with the connections.
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let conn = self.connections[&id].clone();
            let mut c = conn.borrow_mut();

            if c.meta().is_done() && !c.has_output() {
                drop(c);
                self.pending.push(Op::Remove(id));
                continue;
            }

            let fd = c.raw_fd();
            match (self.registered.get(&id).copied(), fd) {
                (Some(old), Some(new)) if old != new => {
                    self.sources.unregister(&id);
                    self.sources.register(id, &Fd(new), popol::interest::READ);
                    self.registered.insert(id, new);
                }
                (Some(_), None) => {
                    self.sources.unregister(&id);
                    self.registered.remove(&id);
                }
                (None, Some(new)) => {
                    self.sources.register(id, &Fd(new), popol::interest::READ);
                    self.registered.insert(id, new);
                }
                _ => {}
            }

            let enabled = c.meta().is_enabled();

            if let Some(source) = self.sources.get_mut(&id) {
                if enabled && (c.want_read() || c.want_listen() || c.want_signal()) {
                    source.set(popol::interest::READ);
                } else {
                    source.unset(popol::interest::READ);
                }
                if enabled && c.want_write() {
                    source.set(popol::interest::WRITE);
                } else {
                    source.unset(popol::interest::WRITE);
                }
            }

            if enabled && c.has_pending_work() {
                immediate = true;
            }

            match c.meta_mut().schedule(now) {
                Some(time) => self.timeouts.register(id, time),
                None => self.timeouts.unregister(&id),
            }
        }
        self.flush_ops();

        // Wait for readiness up to the soonest timeout.
        let wait = if immediate {
            LocalDuration::from_secs(0)
        } else {
            self.timeouts.next(now).unwrap_or(max_wait).min(max_wait)
        };

        trace!(
            target: "reactor",
            "Polling {} connection(s) and {} timeout(s), waking up in {}..",
            self.connections.len(),
            self.timeouts.len(),
            wait,
        );

        let mut events = Vec::with_capacity(32);
        let result = self.sources.wait_timeout(&mut events, wait.into());
        let now = LocalTime::now();

        match result {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }

        // Collapse raw events into per-connection readiness.
        let mut ready: HashMap<ConnectionId, Readiness> = HashMap::new();
        for event in events.drain(..) {
            if event.key == WAKER_ID {
                popol::Waker::reset(event.source).ok();
                continue;
            }

            let flags = ready.entry(event.key).or_default();

            flags.error |= event.is_error();
            flags.hangup |= event.is_hangup();
            flags.invalid |= event.is_invalid();
            flags.readable |= event.is_readable();
            flags.writable |= event.is_writable();
        }

        // Connections holding unprocessed input are treated as readable so
        // their buffered work drains under the same budgets.
        for (id, conn) in &self.connections {
            let c = conn.borrow();

            if c.meta().is_enabled() && c.has_pending_work() {
                ready.entry(*id).or_default().readable = true;
            }
        }

        // Dispatch in descending priority order: all events of a
        // higher-priority connection are delivered before any event of a
        // lower-priority one.
        let mut order: Vec<(u8, ConnectionId, Readiness)> = ready
            .into_iter()
            .filter_map(|(id, flags)| {
                self.connections
                    .get(&id)
                    .map(|conn| (conn.borrow().meta().priority(), id, flags))
            })
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, id, flags) in order {
            self.deliver(id, flags, now);
        }

        // Fire elapsed timeouts, highest priority first.
        let mut woken = Vec::new();
        self.timeouts.wake(now, &mut woken);

        let mut order: Vec<(u8, ConnectionId)> = woken
            .into_iter()
            .filter_map(|id| {
                self.connections
                    .get(&id)
                    .map(|conn| (conn.borrow().meta().priority(), id))
            })
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, id) in order {
            let Some(conn) = self.connections.get(&id).cloned() else {
                continue;
            };
            if !conn.borrow().meta().is_enabled() {
                continue;
            }
            conn.borrow_mut().meta_mut().fired(now);
            self.dispatch(&conn, id, Deliver::Timeout, now);
        }

        self.flush_ops();
        Ok(())
    }

    /// Deliver one connection's events in precedence order: error, hangup,
    /// invalid, then read/accept/signal, then write.
    fn deliver(&mut self, id: ConnectionId, flags: Readiness, now: LocalTime) {
        let callbacks = [
            (flags.error, Deliver::Error),
            (flags.hangup, Deliver::Hup),
            (flags.invalid, Deliver::Invalid),
            (flags.readable, Deliver::Read),
            (flags.writable, Deliver::Write),
        ];

        for (wanted, kind) in callbacks {
            if !wanted {
                continue;
            }
            // The connection may have been removed by an earlier callback.
            let Some(conn) = self.connections.get(&id).cloned() else {
                return;
            };

            let kind = match kind {
                Deliver::Invalid => {
                    // The descriptor is gone; drop the stale registration.
                    if self.registered.remove(&id).is_some() {
                        self.sources.unregister(&id);
                    }
                    Deliver::Invalid
                }
                Deliver::Read => {
                    let c = conn.borrow();
                    if c.want_listen() {
                        Deliver::Accept
                    } else if c.want_signal() {
                        Deliver::Signal
                    } else {
                        Deliver::Read
                    }
                }
                other => other,
            };

            self.dispatch(&conn, id, kind, now);
        }
    }

    /// Invoke one callback, containing panics: a callback that panics is
    /// logged, the connection observes one `process_error`, and it is
    /// removed. The reactor never rethrows into application code.
    fn dispatch(&mut self, conn: &ConnectionRef, id: ConnectionId, kind: Deliver, now: LocalTime) {
        let mut ctl = self.control(id, now);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut c = conn.borrow_mut();

            match kind {
                Deliver::Error => c.process_error(&mut ctl),
                Deliver::Hup => c.process_hup(&mut ctl),
                Deliver::Invalid => c.process_invalid(&mut ctl),
                Deliver::Read => c.process_read(&mut ctl),
                Deliver::Write => c.process_write(&mut ctl),
                Deliver::Accept => c.process_accept(&mut ctl),
                Deliver::Signal => c.process_signal(&mut ctl),
                Deliver::Timeout => c.process_timeout(&mut ctl),
            }
        }));

        if let Err(payload) = result {
            error!(
                target: "reactor",
                "{}: {:?} callback panicked: {}",
                conn.borrow().meta().name(),
                kind,
                panic_message(&payload),
            );

            let already_errored = {
                let mut c = conn.borrow_mut();
                let errored = c.meta().errored;
                c.meta_mut().errored = true;
                errored
            };
            if !already_errored && kind != Deliver::Error {
                panic::catch_unwind(AssertUnwindSafe(|| {
                    conn.borrow_mut().process_error(&mut ctl);
                }))
                .ok();
            }
            ctl.remove(id);
        }

        self.absorb(ctl);
        self.flush_ops();
    }

    fn control(&self, current: ConnectionId, now: LocalTime) -> Control {
        Control {
            now,
            current,
            next_id: self.next_id,
            ops: Vec::new(),
        }
    }

    /// Take back the ops queued on a control handle.
    fn absorb(&mut self, ctl: Control) {
        self.next_id = ctl.next_id;
        self.pending.extend(ctl.ops);
    }

    /// Apply queued structural changes.
    fn flush_ops(&mut self) {
        while !self.pending.is_empty() {
            let ops = std::mem::take(&mut self.pending);

            for op in ops {
                match op {
                    Op::Add(id, conn) => {
                        if let Err(e) = self.attach(id, conn) {
                            error!(target: "reactor", "Cannot attach connection: {}", e);
                        }
                    }
                    Op::Remove(id) => self.detach(id),
                    Op::Done(id) => {
                        if let Some(conn) = self.connections.get(&id) {
                            conn.borrow_mut().meta_mut().mark_done();
                        }
                    }
                    Op::Quit => self.quit = true,
                }
            }
        }
    }

    fn attach(&mut self, id: ConnectionId, conn: ConnectionRef) -> Result<ConnectionId, Error> {
        {
            let mut c = conn.borrow_mut();

            if c.meta().id().is_some() {
                return Err(Error::AlreadyAttached(c.meta().name().to_string()));
            }
            c.meta_mut().id = Some(id);
            c.meta_mut().errored = false;

            if let Some(fd) = c.raw_fd() {
                self.sources.register(id, &Fd(fd), popol::interest::READ);
                self.registered.insert(id, fd);
            }

            trace!(target: "reactor", "{}: Connection attached ({:?})", c.meta().name(), id);
        }
        self.connections.insert(id, conn.clone());

        let mut ctl = self.control(id, LocalTime::now());
        panic::catch_unwind(AssertUnwindSafe(|| {
            conn.borrow_mut().connection_added(&mut ctl);
        }))
        .ok();
        self.absorb(ctl);

        Ok(id)
    }

    fn detach(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        if self.registered.remove(&id).is_some() {
            self.sources.unregister(&id);
        }
        self.timeouts.unregister(&id);
        conn.borrow_mut().meta_mut().id = None;

        trace!(
            target: "reactor",
            "{}: Connection detached ({:?})",
            conn.borrow().meta().name(),
            id,
        );

        let mut ctl = self.control(id, LocalTime::now());
        panic::catch_unwind(AssertUnwindSafe(|| {
            conn.borrow_mut().connection_removed(&mut ctl);
        }))
        .ok();
        self.absorb(ctl);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Meta;
    use crate::sys;

    /// Records the callbacks it observes; readable through a shared log.
    struct Probe {
        meta: Meta,
        fd: Option<std::os::fd::OwnedFd>,
        log: Rc<RefCell<Vec<String>>>,
        remove_on_read: bool,
        panic_on_read: bool,
    }

    impl Probe {
        fn new(name: &str, fd: Option<std::os::fd::OwnedFd>, log: Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                meta: Meta::new(name),
                fd,
                log,
                remove_on_read: false,
                panic_on_read: false,
            }
        }

        fn record(&self, event: &str) {
            self.log
                .borrow_mut()
                .push(format!("{}:{}", self.meta.name(), event));
        }
    }

    impl Connection for Probe {
        fn meta(&self) -> &Meta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut Meta {
            &mut self.meta
        }

        fn raw_fd(&self) -> Option<RawFd> {
            self.fd.as_ref().map(|fd| fd.as_raw_fd())
        }

        fn process_read(&mut self, ctl: &mut Control) {
            let mut buf = [0u8; 64];
            if let Some(fd) = &self.fd {
                sys::read(fd, &mut buf).ok();
            }
            self.record("read");

            if self.panic_on_read {
                panic!("probe asked to panic");
            }
            if self.remove_on_read {
                ctl.remove_self();
            }
        }

        fn process_error(&mut self, ctl: &mut Control) {
            self.record("error");
            ctl.remove_self();
        }

        fn process_timeout(&mut self, _ctl: &mut Control) {
            self.record("timeout");
        }

        fn connection_added(&mut self, _ctl: &mut Control) {
            self.record("added");
        }

        fn connection_removed(&mut self, _ctl: &mut Control) {
            self.record("removed");
        }
    }

    fn probe(
        reactor: &mut Reactor,
        name: &str,
        fd: Option<std::os::fd::OwnedFd>,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> (ConnectionId, Rc<RefCell<Probe>>) {
        let conn = Rc::new(RefCell::new(Probe::new(name, fd, log.clone())));
        let id = reactor.add(conn.clone()).unwrap();

        (id, conn)
    }

    #[test]
    fn test_add_remove_lifecycle() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (id, conn) = probe(&mut reactor, "a", None, &log);
        assert_eq!(conn.borrow().meta().id(), Some(id));

        // Adding the same connection twice fails.
        assert!(matches!(
            reactor.add(conn.clone()),
            Err(Error::AlreadyAttached(_))
        ));

        reactor.remove(id);
        reactor.remove(id); // idempotent
        reactor.poll(LocalDuration::from_millis(1)).unwrap();

        assert!(conn.borrow().meta().id().is_none());
        assert_eq!(reactor.len(), 0);
        assert_eq!(*log.borrow(), vec!["a:added", "a:removed"]);
    }

    #[test]
    fn test_priority_ordering() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r1, w1) = sys::pipe().unwrap();
        let (r2, w2) = sys::pipe().unwrap();

        let (_, low) = probe(&mut reactor, "low", Some(r1), &log);
        let (_, high) = probe(&mut reactor, "high", Some(r2), &log);

        low.borrow_mut().meta_mut().set_priority(10);
        high.borrow_mut().meta_mut().set_priority(90);

        // Make both readable; the high priority connection must be
        // dispatched first even though it was added second.
        sys::write(&w1, b"x").unwrap();
        sys::write(&w2, b"x").unwrap();
        reactor.poll(LocalDuration::from_millis(100)).unwrap();

        let log = log.borrow();
        let reads: Vec<_> = log.iter().filter(|l| l.ends_with(":read")).collect();
        assert_eq!(reads, vec!["high:read", "low:read"]);
    }

    #[test]
    fn test_remove_during_callback_is_safe() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r, w) = sys::pipe().unwrap();
        let (_, conn) = probe(&mut reactor, "a", Some(r), &log);
        conn.borrow_mut().remove_on_read = true;

        sys::write(&w, b"x").unwrap();
        reactor.poll(LocalDuration::from_millis(100)).unwrap();

        assert_eq!(reactor.len(), 0);
        assert_eq!(*log.borrow(), vec!["a:added", "a:read", "a:removed"]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r, w) = sys::pipe().unwrap();
        let (_, conn) = probe(&mut reactor, "a", Some(r), &log);
        conn.borrow_mut().panic_on_read = true;

        sys::write(&w, b"x").unwrap();
        reactor.poll(LocalDuration::from_millis(100)).unwrap();

        // The panic is contained, the connection observes an error and is
        // removed; the reactor survives.
        assert_eq!(reactor.len(), 0);
        assert_eq!(
            *log.borrow(),
            vec!["a:added", "a:read", "a:error", "a:removed"]
        );
    }

    #[test]
    fn test_one_shot_timeout_fires_once() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (_, conn) = probe(&mut reactor, "t", None, &log);
        conn.borrow_mut()
            .meta_mut()
            .set_timeout_date(Some(LocalTime::now()));

        reactor.poll(LocalDuration::from_millis(10)).unwrap();
        reactor.poll(LocalDuration::from_millis(10)).unwrap();

        let count = log.borrow().iter().filter(|l| *l == "t:timeout").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_disabled_connection_gets_no_events() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (r, w) = sys::pipe().unwrap();
        let (_, conn) = probe(&mut reactor, "a", Some(r), &log);
        conn.borrow_mut().meta_mut().set_enabled(false);

        sys::write(&w, b"x").unwrap();
        reactor.poll(LocalDuration::from_millis(10)).unwrap();

        assert!(!log.borrow().iter().any(|l| l == "a:read"));
    }

    #[test]
    fn test_instance_is_per_thread() {
        let a = Reactor::instance();
        let b = Reactor::instance();
        assert!(Rc::ptr_eq(&a, &b));

        let other = std::thread::spawn(|| {
            Reactor::instance().borrow().len()
        })
        .join()
        .unwrap();
        assert_eq!(other, 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        probe(&mut reactor, "a", None, &log);
        probe(&mut reactor, "b", None, &log);
        assert_eq!(reactor.list().len(), 2);

        reactor.clear();
        assert!(reactor.is_empty());
    }
}
