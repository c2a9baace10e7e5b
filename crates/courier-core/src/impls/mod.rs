//! Port implementations that ship with the core crate.
//!
//! Production brokers live in their own crates and implement
//! [`MessageBroker`](crate::ports::MessageBroker) directly.

pub mod inmem_broker;

pub use self::inmem_broker::{
    BrokerCounts, BrokerEvent, BrokerEventKind, BrokerOperation, DeadLetter, InMemoryBroker,
};
