//! MessageBroker port - the queue/subscription receiver the consumer drives.
//!
//! Connection setup, credentials, wire encoding and queue management all live
//! behind this trait. The consumer only receives, settles and renews.
//!
//! # Cancellation
//! Methods take no context argument. Callers cancel by dropping the future
//! (the dispatch loop races `receive_messages` against its cancellation
//! token) and bound settlement with a timeout. Implementations must therefore
//! be cancel-safe: a dropped `receive_messages` must not lose messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BrokerError, Message};

/// Peek-lock receiver shared by the dispatch loop and every running job.
///
/// # Thread Safety
/// - `Send + Sync` and used concurrently without external locking.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Receive up to `max_count` messages, waiting until at least one is available.
    ///
    /// May return fewer than `max_count`. Returns [`BrokerError::Cancelled`]
    /// if the broker itself observed a cancellation.
    async fn receive_messages(&self, max_count: usize) -> Result<Vec<Message>, BrokerError>;

    /// Complete the message; it will not be redelivered.
    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError>;

    /// Abandon the message so it becomes available for redelivery.
    async fn requeue(&self, message: &Message) -> Result<(), BrokerError>;

    /// Move the message to the dead-letter side channel with `reason`.
    async fn reject(&self, message: &Message, reason: &str) -> Result<(), BrokerError>;

    /// Extend the message lock. Returns the new lock expiry.
    async fn renew_lock(&self, message: &Message) -> Result<DateTime<Utc>, BrokerError>;

    /// Close the receiver. Subsequent calls fail with [`BrokerError::Closed`].
    async fn close(&self) -> Result<(), BrokerError>;
}
