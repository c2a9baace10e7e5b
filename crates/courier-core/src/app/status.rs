//! Status - point-in-time view of a consumer.

use serde::Serialize;

use crate::app::RunState;
use crate::domain::{ConsumerId, Subject};

/// Snapshot returned by [`Consumer::status`](crate::app::Consumer::status).
///
/// `in_flight`, `max_concurrency` and `capacity` come from one governor load;
/// `state` is read separately and may already have moved on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub consumer_id: ConsumerId,
    pub state: RunState,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub capacity: usize,
    pub subjects: Vec<Subject>,
}

impl ConsumerStatus {
    /// Idle with nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.state == RunState::Idle && self.in_flight == 0
    }
}
