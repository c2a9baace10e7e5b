//! # Per-job fault boundary.
//!
//! Every dispatched message runs as its own tokio task under [`supervise`],
//! the only place that catches a handler panic.
//!
//! ## Outcomes
//! ```text
//! handler returns ──► Completed ──► (warn if the lease is still pending)
//! handler panics  ──► Faulted   ──► lease.reject("handler panicked: ...")
//! ```
//! In both cases the job token is cancelled (stopping any keep-alive) and the
//! concurrency permit is dropped, in that order, when the task exits.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::app::{JobPermit, Lease, MessageHandler};

/// Result of one handler execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The handler panicked; carries the rendered panic payload.
    Faulted(String),
}

/// Everything one execution unit owns.
pub struct Job {
    pub handler: Arc<dyn MessageHandler>,
    pub lease: Lease,
    pub permit: JobPermit,
    pub cancel: CancellationToken,
}

/// Poll `fut` to completion, converting a panic into [`JobOutcome::Faulted`].
pub async fn supervise<F>(fut: F) -> JobOutcome
where
    F: Future<Output = ()>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => JobOutcome::Completed,
        Err(payload) => JobOutcome::Faulted(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Launch `job` on its own task.
///
/// The returned handle resolves to the job's outcome; the dispatch loop
/// drops it, tests await it.
pub fn spawn_job(job: Job) -> JoinHandle<JobOutcome> {
    tokio::spawn(run_job(job))
}

async fn run_job(job: Job) -> JobOutcome {
    let Job {
        handler,
        lease,
        permit,
        cancel,
    } = job;
    let _permit = permit;
    let _cancel_on_exit = cancel.clone().drop_guard();

    let handler_lease = lease.clone();
    let outcome = supervise(async move { handler.handle(cancel, handler_lease).await }).await;

    match &outcome {
        JobOutcome::Completed => {
            if !lease.is_settled() {
                warn!(
                    message_id = %lease.id(),
                    "handler returned without settling; message left to lock expiry"
                );
            }
        }
        JobOutcome::Faulted(payload) => {
            error!(message_id = %lease.id(), panic = %payload, "handler panicked; rejecting message");
            let reason = format!("handler panicked: {payload}");
            if let Err(err) = lease.reject(&reason).await {
                warn!(message_id = %lease.id(), error = %err, "failed to reject faulted message");
            }
        }
    }
    outcome
}
