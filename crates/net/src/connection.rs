//! The connection model: anything a reactor can own and drive.
//!
//! A connection wraps a file descriptor (or a virtual event source such as
//! a timer) together with per-connection scheduling state. Connections are
//! stored in an arena owned by the reactor; callbacks receive a [`Control`]
//! through which structural changes (add, remove, quit) are queued and
//! consumed at iteration boundaries.
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::time::{LocalDuration, LocalTime};

/// Lowest connection priority.
pub const PRIORITY_MIN: u8 = 0;
/// Highest connection priority.
pub const PRIORITY_MAX: u8 = 100;
/// Default connection priority.
pub const PRIORITY_DEFAULT: u8 = 50;
/// Default number of events one connection may process per reactor step.
pub const EVENT_LIMIT_DEFAULT: usize = 5;
/// Default wall-clock budget one connection may consume per reactor step.
pub const PROCESSING_BUDGET_DEFAULT: LocalDuration = LocalDuration::from_millis(500);

/// Identifier of a connection within its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

/// A connection held by reactor and application code alike.
pub type ConnectionRef = Rc<RefCell<dyn Connection>>;

/// Per-connection bookkeeping embedded by every connection kind.
#[derive(Debug, Clone)]
pub struct Meta {
    name: String,
    priority: u8,
    enabled: bool,
    done: bool,
    event_limit: usize,
    processing_budget: LocalDuration,
    timeout_delay: Option<LocalDuration>,
    timeout_date: Option<LocalTime>,
    next_fire: Option<LocalTime>,
    pub(crate) id: Option<ConnectionId>,
    pub(crate) errored: bool,
}

impl Meta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: PRIORITY_DEFAULT,
            enabled: true,
            done: false,
            event_limit: EVENT_LIMIT_DEFAULT,
            processing_budget: PROCESSING_BUDGET_DEFAULT,
            timeout_delay: None,
            timeout_date: None,
            next_fire: None,
            id: None,
            errored: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The reactor id, while attached.
    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(PRIORITY_MAX);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the connection asked to be removed once its output drains.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Request graceful removal after pending writes drain.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn event_limit(&self) -> usize {
        self.event_limit
    }

    /// Maximum events processed per reactor step; `1` yields after each.
    pub fn set_event_limit(&mut self, limit: usize) {
        self.event_limit = limit.max(1);
    }

    pub fn processing_budget(&self) -> LocalDuration {
        self.processing_budget
    }

    /// Wall-clock budget per reactor step.
    pub fn set_processing_budget(&mut self, budget: LocalDuration) {
        self.processing_budget = budget;
    }

    pub fn timeout_delay(&self) -> Option<LocalDuration> {
        self.timeout_delay
    }

    /// Schedule a repeating timeout every `delay`; `None` disables. Clears
    /// any one-shot date, since a connection has at most one pending
    /// timeout.
    pub fn set_timeout_delay(&mut self, delay: Option<LocalDuration>) {
        self.timeout_delay = delay;
        self.timeout_date = None;
        self.next_fire = None;
    }

    pub fn timeout_date(&self) -> Option<LocalTime> {
        self.timeout_date
    }

    /// Schedule a one-shot timeout at an absolute time; `None` disables.
    pub fn set_timeout_date(&mut self, date: Option<LocalTime>) {
        self.timeout_date = date;
        self.timeout_delay = None;
        self.next_fire = None;
    }

    /// The next time `process_timeout` is owed, arming repeating timers
    /// relative to `now` on first call.
    pub(crate) fn schedule(&mut self, now: LocalTime) -> Option<LocalTime> {
        if !self.enabled {
            return None;
        }
        if let Some(date) = self.timeout_date {
            return Some(date);
        }
        if let Some(delay) = self.timeout_delay {
            let fire = *self.next_fire.get_or_insert(now + delay);
            return Some(fire);
        }
        None
    }

    /// Record a timeout delivery. Repeating timers re-arm from the moment
    /// of firing; one-shot dates are consumed.
    pub(crate) fn fired(&mut self, now: LocalTime) {
        if self.timeout_date.is_some() {
            self.timeout_date = None;
        } else if let Some(delay) = self.timeout_delay {
            self.next_fire = Some(now + delay);
        }
    }
}

/// Structural changes requested from inside a callback.
pub(crate) enum Op {
    Add(ConnectionId, ConnectionRef),
    Remove(ConnectionId),
    Done(ConnectionId),
    Quit,
}

/// Handle given to every connection callback.
///
/// Mutations queued here are applied by the reactor at the end of the
/// current iteration, so a connection removed mid-callback keeps existing
/// until its callback returns.
pub struct Control {
    pub(crate) now: LocalTime,
    pub(crate) current: ConnectionId,
    pub(crate) next_id: u64,
    pub(crate) ops: Vec<Op>,
}

impl Control {
    /// The time the current reactor iteration started.
    pub fn now(&self) -> LocalTime {
        self.now
    }

    /// The id of the connection whose callback is running.
    pub fn connection_id(&self) -> ConnectionId {
        self.current
    }

    /// Queue a new connection; its id is assigned immediately and the
    /// attach happens at the iteration boundary.
    pub fn add(&mut self, conn: ConnectionRef) -> ConnectionId {
        let id = ConnectionId(self.next_id);

        self.next_id += 1;
        self.ops.push(Op::Add(id, conn));
        id
    }

    /// Queue removal of a connection. Idempotent.
    pub fn remove(&mut self, id: ConnectionId) {
        self.ops.push(Op::Remove(id));
    }

    /// Queue removal of the connection whose callback is running.
    pub fn remove_self(&mut self) {
        let id = self.current;
        self.remove(id);
    }

    /// Mark a connection done: it goes away once its pending output has
    /// drained. Safe to call for the connection whose callback is running.
    pub fn done(&mut self, id: ConnectionId) {
        self.ops.push(Op::Done(id));
    }

    /// Ask the reactor to stop after this iteration.
    pub fn quit(&mut self) {
        self.ops.push(Op::Quit);
    }
}

/// A single participant in a reactor.
///
/// The `want_*` methods are polled at the start of every iteration to
/// build the interest list; the `process_*` callbacks deliver readiness,
/// in the documented precedence order. Callbacks run on the reactor thread
/// and must not block.
pub trait Connection {
    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;

    /// The descriptor to poll, or `None` for virtual connections (timers).
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Interest in reading.
    fn want_read(&self) -> bool {
        self.raw_fd().is_some()
    }

    /// Interest in writing; usually true while an output buffer is
    /// non-empty.
    fn want_write(&self) -> bool {
        false
    }

    /// Whether readiness means an incoming connection to accept.
    fn want_listen(&self) -> bool {
        false
    }

    /// Whether readiness means a delivered signal.
    fn want_signal(&self) -> bool {
        false
    }

    /// Input already buffered but not yet processed; forces the next
    /// iteration to run without waiting.
    fn has_pending_work(&self) -> bool {
        false
    }

    /// Whether unsent output remains; a `done` connection with no output
    /// is removed by the reactor.
    fn has_output(&self) -> bool {
        false
    }

    fn process_read(&mut self, _ctl: &mut Control) {}

    fn process_write(&mut self, _ctl: &mut Control) {}

    fn process_accept(&mut self, _ctl: &mut Control) {}

    fn process_signal(&mut self, _ctl: &mut Control) {}

    fn process_timeout(&mut self, _ctl: &mut Control) {}

    /// An error was reported on the descriptor. The default gives up on
    /// the connection.
    fn process_error(&mut self, ctl: &mut Control) {
        ctl.remove_self();
    }

    /// The remote end hung up.
    fn process_hup(&mut self, ctl: &mut Control) {
        ctl.remove_self();
    }

    /// The descriptor is invalid (already closed); the source was
    /// unregistered by the reactor before this call.
    fn process_invalid(&mut self, ctl: &mut Control) {
        ctl.remove_self();
    }

    /// Called exactly once when the connection is attached.
    fn connection_added(&mut self, _ctl: &mut Control) {}

    /// Called exactly once when the connection is detached.
    fn connection_removed(&mut self, _ctl: &mut Control) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_defaults() {
        let meta = Meta::new("test");

        assert_eq!(meta.priority(), PRIORITY_DEFAULT);
        assert_eq!(meta.event_limit(), EVENT_LIMIT_DEFAULT);
        assert_eq!(meta.processing_budget(), PROCESSING_BUDGET_DEFAULT);
        assert!(meta.is_enabled());
        assert!(!meta.is_done());
        assert!(meta.id().is_none());
    }

    #[test]
    fn test_meta_clamps() {
        let mut meta = Meta::new("test");

        meta.set_priority(200);
        assert_eq!(meta.priority(), PRIORITY_MAX);

        meta.set_event_limit(0);
        assert_eq!(meta.event_limit(), 1);
    }

    #[test]
    fn test_repeating_timeout_rearms_from_firing() {
        let mut meta = Meta::new("timer");
        let now = LocalTime::from_secs(100);

        meta.set_timeout_delay(Some(LocalDuration::from_secs(5)));
        assert_eq!(meta.schedule(now), Some(now + LocalDuration::from_secs(5)));

        // Scheduling again does not push the deadline back.
        let later = now + LocalDuration::from_secs(3);
        assert_eq!(meta.schedule(later), Some(now + LocalDuration::from_secs(5)));

        let fired_at = now + LocalDuration::from_secs(6);
        meta.fired(fired_at);
        assert_eq!(
            meta.schedule(fired_at),
            Some(fired_at + LocalDuration::from_secs(5))
        );
    }

    #[test]
    fn test_one_shot_timeout_consumed() {
        let mut meta = Meta::new("timer");
        let now = LocalTime::from_secs(100);
        let date = now + LocalDuration::from_secs(1);

        meta.set_timeout_date(Some(date));
        assert_eq!(meta.schedule(now), Some(date));

        meta.fired(date);
        assert_eq!(meta.schedule(date), None);
    }

    #[test]
    fn test_disabled_timeout() {
        let mut meta = Meta::new("timer");
        let now = LocalTime::from_secs(100);

        meta.set_timeout_delay(Some(LocalDuration::from_secs(5)));
        meta.set_timeout_delay(None);
        assert_eq!(meta.schedule(now), None);

        meta.set_timeout_date(Some(now));
        meta.set_enabled(false);
        assert_eq!(meta.schedule(now), None);
    }
}
