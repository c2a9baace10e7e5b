//! IdGenerator port - id generation behind a trait so tests can pin time.

use crate::domain::{ConsumerId, MessageId};
use crate::ports::Clock;
use ulid::Ulid;

/// Generates ids for messages and consumers.
///
/// # Thread Safety
/// - `Send + Sync` is required; brokers generate ids from many tasks.
pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> MessageId;

    fn generate_consumer_id(&self) -> ConsumerId;
}

/// ULID generator whose timestamp part comes from a [`Clock`].
///
/// With a `MonotonicClock` under paused tokio time, ids still sort by
/// (virtual) creation time.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_message_id(&self) -> MessageId {
        MessageId::from(self.next_ulid())
    }

    fn generate_consumer_id(&self) -> ConsumerId {
        ConsumerId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let a = id_gen.generate_message_id();
        let b = id_gen.generate_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn timestamp_part_comes_from_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let a = id_gen.generate_message_id();
        let b = id_gen.generate_consumer_id();

        assert_eq!(a.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert!(b.to_string().starts_with("consumer-"));
    }
}
