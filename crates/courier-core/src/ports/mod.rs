//! Ports - the seams to external systems.
//!
//! The broker is the only real collaborator; clock and id generation are
//! ports so that tests can control time.

pub mod broker;
pub mod clock;
pub mod id_generator;

pub use self::broker::MessageBroker;
pub use self::clock::{Clock, FixedClock, MonotonicClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
