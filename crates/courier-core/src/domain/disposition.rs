//! Terminal outcome of a leased message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Disposition of a message held by a lease.
///
/// State transitions:
/// - Pending -> Acknowledged
/// - Pending -> Requeued
/// - Pending -> Rejected
///
/// Exactly one transition ever happens; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    /// Received and not yet settled.
    Pending,

    /// Consumed; the broker will not redeliver it.
    Acknowledged,

    /// Handed back to the broker for redelivery.
    Requeued,

    /// Dead-lettered for operator inspection.
    Rejected,
}

impl Disposition {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Disposition::Pending)
    }

    /// Stable snake_case label for logs.
    pub fn as_label(self) -> &'static str {
        match self {
            Disposition::Pending => "pending",
            Disposition::Acknowledged => "acknowledged",
            Disposition::Requeued => "requeued",
            Disposition::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}
