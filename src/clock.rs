//! Time source abstraction.
//!
//! Cache TTLs, quote expiry, webhook backoff, and circuit-breaker windows all
//! compare against "now". Components take the time source through the
//! [`Clock`] trait so tests can drive those comparisons deterministically
//! instead of sleeping.

use chrono::{DateTime, Utc};
#[cfg(test)]
use chrono::Duration;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Clock for Arc<dyn Clock> {
    fn now(&self) -> DateTime<Utc> {
        self.as_ref().now()
    }
}

/// Manually advanced clock for tests.
///
/// Time is stored as milliseconds since epoch in an atomic, so a shared
/// `Arc<ManualClock>` can be advanced from the test body while components
/// read it concurrently.
#[cfg(test)]
pub struct ManualClock {
    millis: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn epoch() -> Self {
        Self {
            millis: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}
