//! Concurrency governor: the in-flight job counter and its ceiling.
//!
//! Both values live in one `AtomicU64` (ceiling in the high half, in-flight in
//! the low half), so every read sees a consistent pair and admission is a
//! single compare-and-swap. Capacity is recomputed on every poll instead of
//! being reserved, so a job that finishes mid-cycle frees a slot for the very
//! next receive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const LOW_MASK: u64 = u32::MAX as u64;

fn pack(max: u32, in_flight: u32) -> u64 {
    ((max as u64) << 32) | in_flight as u64
}

fn unpack(slots: u64) -> (u32, u32) {
    ((slots >> 32) as u32, (slots & LOW_MASK) as u32)
}

/// Tracks in-flight jobs against `max_concurrency`.
///
/// Shared by the dispatch loop (acquire) and every job (release via
/// [`JobPermit`] drop).
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    slots: AtomicU64,
}

impl ConcurrencyGovernor {
    /// `max_concurrency` is clamped to `1..=u32::MAX`; validate it beforehand.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            slots: AtomicU64::new(pack(clamp_max(max_concurrency), 0)),
        }
    }

    /// `max(0, max_concurrency - in_flight)` from one atomic snapshot.
    pub fn capacity(&self) -> usize {
        let (max, in_flight) = unpack(self.slots.load(Ordering::Acquire));
        max.saturating_sub(in_flight) as usize
    }

    pub fn in_flight(&self) -> usize {
        unpack(self.slots.load(Ordering::Acquire)).1 as usize
    }

    pub fn max_concurrency(&self) -> usize {
        unpack(self.slots.load(Ordering::Acquire)).0 as usize
    }

    /// `(max_concurrency, in_flight)` as one consistent pair.
    pub fn snapshot(&self) -> (usize, usize) {
        let (max, in_flight) = unpack(self.slots.load(Ordering::Acquire));
        (max as usize, in_flight as usize)
    }

    /// Replace the ceiling. Running jobs are unaffected; admission uses the new value.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let max = clamp_max(max_concurrency);
        // The closure always returns Some, so this cannot fail.
        let _ = self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |slots| {
                let (_, in_flight) = unpack(slots);
                Some(pack(max, in_flight))
            });
    }

    /// Admit one job if `in_flight < max_concurrency`.
    pub fn try_acquire(self: &Arc<Self>) -> Option<JobPermit> {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |slots| {
                let (max, in_flight) = unpack(slots);
                (in_flight < max).then(|| pack(max, in_flight + 1))
            })
            .ok()
            .map(|_| JobPermit {
                governor: Arc::clone(self),
            })
    }

    fn release(&self) {
        let released = self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |slots| {
                let (max, in_flight) = unpack(slots);
                in_flight.checked_sub(1).map(|n| pack(max, n))
            });
        if released.is_err() {
            tracing::error!("concurrency release without a matching acquire");
        }
    }
}

fn clamp_max(max_concurrency: usize) -> u32 {
    max_concurrency.clamp(1, u32::MAX as usize) as u32
}

/// One unit of admitted concurrency. Dropping it releases the unit.
#[derive(Debug)]
pub struct JobPermit {
    governor: Arc<ConcurrencyGovernor>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.governor.release();
    }
}
