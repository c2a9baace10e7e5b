use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::MessageId;

/// Routing key carried by a message; handlers are registered per subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject(String);

impl Subject {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Subject {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A message as handed out by the broker in peek-lock mode.
///
/// The body is opaque bytes; decoding it is the handler's business.
/// `locked_until` is the broker's lock expiry at the time of receipt. Renewals
/// are tracked by the [`Lease`](crate::app::Lease), not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    subject: Option<Subject>,
    body: Vec<u8>,
    locked_until: DateTime<Utc>,
    delivery_count: u32,
}

impl Message {
    pub fn new(
        id: MessageId,
        subject: Option<Subject>,
        body: Vec<u8>,
        locked_until: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject,
            body,
            locked_until,
            delivery_count: 1,
        }
    }

    /// Set how many times the broker has handed this message out (1 on first delivery).
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn locked_until(&self) -> DateTime<Utc> {
        self.locked_until
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}
