//! Clock port - wall-clock time for lock expiry arithmetic.
//!
//! Broker lock expiries are wall-clock timestamps, while sleeps run on tokio's
//! monotonic timer. [`MonotonicClock`] bridges the two so that renewal
//! scheduling stays correct across wall-clock jumps and under
//! `tokio::time::pause()` in tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Reads the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// Wall clock anchored once, then advanced by tokio's monotonic `Instant`.
///
/// Must be created inside a tokio runtime when time is paused, so that the
/// anchor instant belongs to the paused clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: DateTime<Utc>,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            anchor: Instant::now(),
        }
    }

    /// Wall-clock time at which the clock was anchored.
    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.anchor.elapsed();
        // chrono::Duration covers ~292 million years; saturate rather than fail.
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX);
        self.origin
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
