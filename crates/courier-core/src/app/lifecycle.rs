//! Consumer run state machine.
//!
//! State transitions:
//! - Idle -> Running      (`begin`: no run active, no stale jobs)
//! - Running -> Stopping  (`stop`: cancellation issued)
//! - Stopping -> Idle     (the run's dispatch loop returned)
//! - Running -> Idle      (the run's dispatch loop returned on its own)
//! - any -> Idle          (`force_idle`: terminate)
//!
//! Each run gets an epoch. A run that ends after a `force_idle` and a newer
//! `begin` carries a stale epoch and leaves the newer run's state alone.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::domain::ConsumerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug)]
struct Inner {
    state: RunState,
    epoch: u64,
    cancel: Option<CancellationToken>,
}

#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RunState::Idle,
                epoch: 0,
                cancel: None,
            }),
        }
    }

    // Every transition leaves Inner consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    /// Run `f` while holding the transition lock, only if Idle.
    ///
    /// `begin` cannot interleave with `f`, so whatever `f` mutates is either
    /// fully visible to the next run or not at all.
    pub fn when_idle<R>(&self, f: impl FnOnce() -> R) -> Result<R, ConsumerError> {
        let inner = self.lock();
        if inner.state != RunState::Idle {
            return Err(ConsumerError::AlreadyRunning);
        }
        let result = f();
        drop(inner);
        Ok(result)
    }

    /// Idle -> Running. `in_flight` is read under the transition lock.
    pub fn begin(&self, in_flight: impl FnOnce() -> usize) -> Result<RunTicket<'_>, ConsumerError> {
        let mut inner = self.lock();
        if inner.state != RunState::Idle {
            return Err(ConsumerError::AlreadyRunning);
        }
        let in_flight = in_flight();
        if in_flight != 0 {
            return Err(ConsumerError::StaleJobs { in_flight });
        }

        inner.epoch += 1;
        let cancel = CancellationToken::new();
        inner.state = RunState::Running;
        inner.cancel = Some(cancel.clone());
        Ok(RunTicket {
            lifecycle: self,
            epoch: inner.epoch,
            cancel,
        })
    }

    /// Running -> Stopping. Returns false (and does nothing) unless Running.
    ///
    /// Idle follows when the run's ticket drops, i.e. once the loop has returned.
    pub fn stop(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != RunState::Running {
            return false;
        }
        if let Some(cancel) = &inner.cancel {
            cancel.cancel();
        }
        inner.state = RunState::Stopping;
        true
    }

    /// Cancel whatever is active and go Idle now. Returns false if already Idle.
    pub fn force_idle(&self) -> bool {
        let mut inner = self.lock();
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        let was_active = inner.state != RunState::Idle;
        inner.state = RunState::Idle;
        inner.epoch += 1;
        was_active
    }

    fn finish(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch == epoch {
            inner.state = RunState::Idle;
            inner.cancel = None;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of an active run. Dropping it cancels the run and returns to Idle,
/// also when the `run` future itself is dropped mid-flight.
#[derive(Debug)]
pub struct RunTicket<'a> {
    lifecycle: &'a Lifecycle,
    epoch: u64,
    cancel: CancellationToken,
}

impl RunTicket<'_> {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RunTicket<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.lifecycle.finish(self.epoch);
    }
}
