//! Time source used by the caches and the sync cool-down.
//!
//! Production code injects [`SystemClock`]. Tests inject a [`ManualClock`] and
//! advance it explicitly instead of sleeping.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// A cached value together with the instant after which it must be refetched.
#[derive(Debug, Clone)]
pub struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    pub fn new(value: T, now: Instant, ttl: Duration) -> Self {
        Expiring {
            value,
            expires_at: now + ttl,
        }
    }

    /// Returns the value if it has not expired at `now`.
    pub fn fresh(&self, now: Instant) -> Option<&T> {
        (now < self.expires_at).then_some(&self.value)
    }
}
