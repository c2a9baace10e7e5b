//! courier-core
//!
//! Bounded-concurrency message consumer engine.
//!
//! # Modules
//! - **domain**: ids, messages, dispositions, errors
//! - **ports**: broker, clock and id-generation seams
//! - **app**: registry, governor, lease, dispatch loop, lifecycle, consumer facade
//! - **impls**: `InMemoryBroker` for tests and local runs

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{
    BuildError, Consumer, ConsumerBuilder, ConsumerConfig, ConsumerStatus, Lease,
    MessageHandler, RunState, handler_fn,
};
pub use domain::{BrokerError, ConsumerError, Disposition, Message, MessageId, Subject};
pub use ports::MessageBroker;
