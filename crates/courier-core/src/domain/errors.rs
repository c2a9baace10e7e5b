//! Error types and their classification.
//!
//! - [`BrokerError`]: failures reported by the message broker.
//! - [`SettlementError`]: a lease operation (ack/requeue/reject/renew) failed.
//! - [`ConsumerError`]: API misuse, receive failures, and drain timeouts.
//!
//! [`ErrorKind`] groups them the way callers act on them: usage errors are
//! never retried, transport errors may warrant a restart of `run`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::{Disposition, MessageId, Subject};

/// Operational classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid API sequencing or configuration. Never retried.
    Usage,
    /// The broker failed for a reason other than cancellation.
    Transport,
    /// The operation was cancelled by its context.
    Cancelled,
    /// A caller-supplied deadline elapsed.
    Timeout,
}

/// Failure reported by a [`MessageBroker`](crate::ports::MessageBroker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection is closed")]
    Closed,

    #[error("lock lost for {0}")]
    LockLost(MessageId),

    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Cancellation-shaped errors end a run normally instead of failing it.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BrokerError::Cancelled)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Cancelled => ErrorKind::Cancelled,
            BrokerError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Transport,
        }
    }
}

/// The four broker round-trips a lease can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOperation {
    Acknowledge,
    Requeue,
    Reject,
    RenewLock,
}

impl LeaseOperation {
    pub fn as_label(self) -> &'static str {
        match self {
            LeaseOperation::Acknowledge => "acknowledge",
            LeaseOperation::Requeue => "requeue",
            LeaseOperation::Reject => "reject",
            LeaseOperation::RenewLock => "renew_lock",
        }
    }

    /// Disposition recorded when this operation succeeds, if it settles the message.
    pub fn disposition(self) -> Option<Disposition> {
        match self {
            LeaseOperation::Acknowledge => Some(Disposition::Acknowledged),
            LeaseOperation::Requeue => Some(Disposition::Requeued),
            LeaseOperation::Reject => Some(Disposition::Rejected),
            LeaseOperation::RenewLock => None,
        }
    }
}

impl fmt::Display for LeaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A lease operation failed. The lease's disposition is left unchanged.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("{operation} failed for {message_id}: {source}")]
    Broker {
        operation: LeaseOperation,
        message_id: MessageId,
        #[source]
        source: BrokerError,
    },

    #[error("cannot {operation} {message_id}: already {disposition}")]
    AlreadySettled {
        operation: LeaseOperation,
        message_id: MessageId,
        disposition: Disposition,
    },
}

impl SettlementError {
    pub fn operation(&self) -> LeaseOperation {
        match self {
            SettlementError::Broker { operation, .. }
            | SettlementError::AlreadySettled { operation, .. } => *operation,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::Broker { source, .. } => source.kind(),
            SettlementError::AlreadySettled { .. } => ErrorKind::Usage,
        }
    }

    /// The broker failure behind this error, if any.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            SettlementError::Broker { source, .. } => Some(source),
            SettlementError::AlreadySettled { .. } => None,
        }
    }
}

/// Errors returned by the consumer API.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("{in_flight} jobs from a previous run are still in flight")]
    StaleJobs { in_flight: usize },

    #[error("duplicate handler for subject={0}")]
    DuplicateSubject(Subject),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to receive messages: {0}")]
    Receive(#[source] BrokerError),

    #[error("drain not finished after {grace:?}; {in_flight} jobs still in flight")]
    DrainTimeout { grace: Duration, in_flight: usize },
}

impl ConsumerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::AlreadyRunning
            | ConsumerError::StaleJobs { .. }
            | ConsumerError::DuplicateSubject(_)
            | ConsumerError::InvalidConfig(_) => ErrorKind::Usage,
            ConsumerError::Receive(source) => source.kind(),
            ConsumerError::DrainTimeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConsumerError::AlreadyRunning => "consumer_already_running",
            ConsumerError::StaleJobs { .. } => "consumer_stale_jobs",
            ConsumerError::DuplicateSubject(_) => "consumer_duplicate_subject",
            ConsumerError::InvalidConfig(_) => "consumer_invalid_config",
            ConsumerError::Receive(_) => "consumer_receive_failed",
            ConsumerError::DrainTimeout { .. } => "consumer_drain_timeout",
        }
    }
}
