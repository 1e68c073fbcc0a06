//! Local clock types and timeout tracking.
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time.
///
/// This clock is monotonic: if the system clock steps backwards, the last
/// recorded time is returned instead.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, Hash)]
pub struct LocalTime {
    /// Microseconds since Epoch.
    micros: u64,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).micros;
        let last = LAST.load(atomic::Ordering::SeqCst);

        if now < last {
            Self { micros: last }
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            Self { micros: now }
        }
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    /// Construct a local time from microseconds since Epoch.
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Whole seconds since Epoch.
    pub const fn as_secs(&self) -> u64 {
        self.micros / 1_000_000
    }

    /// Microseconds since Epoch.
    pub const fn as_micros(&self) -> u64 {
        self.micros
    }

    /// Get the duration since the given time.
    ///
    /// # Panics
    ///
    /// This function will panic if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration(
            self.micros
                .checked_sub(earlier.micros)
                .expect("supplied time is later than self"),
        )
    }

    /// Get the absolute difference between two times.
    pub fn diff(&self, other: LocalTime) -> LocalDuration {
        if self > &other {
            self.duration_since(other)
        } else {
            other.duration_since(*self)
        }
    }
}

/// Convert a `SystemTime` into a local time.
impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let micros = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        Self { micros }
    }
}

/// Substract two local times. Yields a duration.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.micros.saturating_sub(other.micros))
    }
}

/// Substract a duration from a local time. Yields a local time.
impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            micros: self.micros.saturating_sub(other.0),
        }
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            micros: self.micros + other.0,
        }
    }
}

/// Time duration as measured locally, in microseconds.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Maximum duration.
    pub const MAX: LocalDuration = LocalDuration(u64::MAX);

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Create a new duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000)
    }

    /// Construct a new duration from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Return the number of minutes in this duration.
    pub const fn as_mins(&self) -> u64 {
        self.as_secs() / 60
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Return the number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000
    }

    /// Return the number of microseconds in this duration.
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Clamp the duration between two bounds.
    pub fn clamp(self, min: LocalDuration, max: LocalDuration) -> LocalDuration {
        Self(self.0.clamp(min.0, max.0))
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            dur if dur.as_millis() < 1000 => write!(f, "{} millisecond(s)", self.as_millis()),
            dur if dur.as_secs() < 60 => {
                let fraction = self.as_millis() % 1000;
                if fraction > 0 {
                    return write!(f, "{}.{} second(s)", self.as_secs(), fraction);
                }
                write!(f, "{} second(s)", self.as_secs())
            }
            dur if dur.as_mins() < 60 => {
                let fraction = self.as_secs() % 60;
                if fraction > 0 {
                    return write!(
                        f,
                        "{:.2} minutes(s)",
                        self.as_mins() as f64 + (fraction as f64 / 60.)
                    );
                }
                write!(f, "{} minutes(s)", self.as_mins())
            }
            _ => {
                let fraction = self.as_mins() % 60;
                if fraction > 0 {
                    return write!(f, "{:.2} hour(s)", self.as_mins() as f64 / 60.);
                }
                write!(f, "{} hour(s)", self.as_mins() / 60)
            }
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Div<u32> for LocalDuration {
    type Output = LocalDuration;

    fn div(self, other: u32) -> LocalDuration {
        LocalDuration(self.0 / other as u64)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0.saturating_mul(other))
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_micros(other.0)
    }
}

impl From<std::time::Duration> for LocalDuration {
    fn from(other: std::time::Duration) -> Self {
        Self(other.as_micros() as u64)
    }
}

/// Manages timers and triggers timeouts.
///
/// Every key has at most one pending wake-up time; registering a key again
/// replaces its previous deadline.
#[derive(Debug)]
pub struct TimeoutManager<K> {
    timeouts: Vec<(K, LocalTime)>,
}

impl<K: PartialEq> TimeoutManager<K> {
    /// Create a new timeout manager.
    pub fn new() -> Self {
        Self { timeouts: vec![] }
    }

    /// Return the number of timeouts being tracked.
    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    /// Check whether there are timeouts being tracked.
    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }

    /// Register a timeout with an associated key and wake-up time, replacing
    /// any previous timeout registered for that key.
    pub fn register(&mut self, key: K, time: LocalTime) {
        self.unregister(&key);
        self.timeouts.push((key, time));
        self.timeouts.sort_unstable_by(|(_, a), (_, b)| b.cmp(a));
    }

    /// Drop the timeout registered for a key, if any.
    pub fn unregister(&mut self, key: &K) {
        self.timeouts.retain(|(k, _)| k != key);
    }

    /// Get the minimum time duration we should wait for at least one timeout
    /// to be reached. Returns `None` if there are no timeouts.
    pub fn next(&self, now: impl Into<LocalTime>) -> Option<LocalDuration> {
        let now = now.into();

        self.timeouts.last().map(|(_, t)| {
            if *t >= now {
                *t - now
            } else {
                LocalDuration::from_secs(0)
            }
        })
    }

    /// Given the current time, populate the input vector with the keys that
    /// have timed out. Returns the number of keys that timed out.
    pub fn wake(&mut self, now: LocalTime, woken: &mut Vec<K>) -> usize {
        let before = woken.len();

        while let Some((k, t)) = self.timeouts.pop() {
            if now >= t {
                woken.push(k);
            } else {
                self.timeouts.push((k, t));
                break;
            }
        }
        woken.len() - before
    }
}

impl<K: PartialEq> Default for TimeoutManager<K> {
    fn default() -> Self {
        Self::new()
    }
}
