//! Timer connection: a virtual connection with no descriptor, driven
//! purely by its timeout.
use tracing::trace;

use crate::connection::{Connection, Control, Meta};
use crate::time::{LocalDuration, LocalTime};

/// Fires a callback on a repeating delay or at a one-shot date.
pub struct Timer {
    meta: Meta,
    on_timeout: Box<dyn FnMut(&mut Control)>,
}

impl Timer {
    /// A timer firing every `delay`, starting one `delay` from now.
    pub fn repeating(
        name: impl Into<String>,
        delay: LocalDuration,
        on_timeout: Box<dyn FnMut(&mut Control)>,
    ) -> Self {
        let mut meta = Meta::new(name);

        meta.set_timeout_delay(Some(delay));
        Self { meta, on_timeout }
    }

    /// A timer firing once at an absolute time.
    pub fn once(
        name: impl Into<String>,
        date: LocalTime,
        on_timeout: Box<dyn FnMut(&mut Control)>,
    ) -> Self {
        let mut meta = Meta::new(name);

        meta.set_timeout_date(Some(date));
        Self { meta, on_timeout }
    }
}

impl Connection for Timer {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn process_timeout(&mut self, ctl: &mut Control) {
        trace!(target: "net", "{}: Timer fired", self.meta.name());
        (self.on_timeout)(ctl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::reactor::Reactor;

    #[test]
    fn test_repeating_timer_fires() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let count = fired.clone();

        let timer = Timer::repeating(
            "tick",
            LocalDuration::from_millis(5),
            Box::new(move |_ctl| *count.borrow_mut() += 1),
        );
        reactor.add(Rc::new(RefCell::new(timer))).unwrap();

        for _ in 0..20 {
            reactor.poll(LocalDuration::from_millis(20)).unwrap();
            if *fired.borrow() >= 2 {
                break;
            }
        }
        assert!(*fired.borrow() >= 2);
    }

    #[test]
    fn test_one_shot_removes_itself() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let count = fired.clone();

        let timer = Timer::once(
            "once",
            LocalTime::now(),
            Box::new(move |ctl| {
                *count.borrow_mut() += 1;
                ctl.remove_self();
            }),
        );
        reactor.add(Rc::new(RefCell::new(timer))).unwrap();

        reactor.poll(LocalDuration::from_millis(10)).unwrap();
        reactor.poll(LocalDuration::from_millis(10)).unwrap();

        assert_eq!(*fired.borrow(), 1);
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_disabled_delay_never_fires() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let count = fired.clone();

        let timer = Timer::repeating(
            "never",
            LocalDuration::from_millis(1),
            Box::new(move |_ctl| *count.borrow_mut() += 1),
        );
        let timer = Rc::new(RefCell::new(timer));

        timer.borrow_mut().meta_mut().set_timeout_delay(None);
        reactor.add(timer).unwrap();

        reactor.poll(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(*fired.borrow(), 0);
    }
}
