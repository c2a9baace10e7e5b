//! App - the consumer engine built on top of the ports.
//!
//! # Components
//! - **Consumer**: public facade (register / run / stop / wait / terminate)
//! - **ConsumerBuilder**: wiring with a fail-fast subject check
//! - **HandlerRegistry**: subject -> handler
//! - **ConcurrencyGovernor**: in-flight counter and ceiling
//! - **Dispatcher**: receive -> route -> launch loop
//! - **Lease**: per-message settlement and lock keep-alive
//! - **supervisor**: per-job panic boundary
//! - **Lifecycle**: Idle / Running / Stopping

pub mod builder;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod governor;
pub mod lease;
pub mod lifecycle;
pub mod registry;
pub mod status;
pub mod supervisor;

pub use self::builder::{BuildError, ConsumerBuilder};
pub use self::config::ConsumerConfig;
pub use self::consumer::Consumer;
pub use self::dispatch::Dispatcher;
pub use self::governor::{ConcurrencyGovernor, JobPermit};
pub use self::lease::{Lease, LeaseContext, renewal_delay};
pub use self::lifecycle::{Lifecycle, RunState, RunTicket};
pub use self::registry::{FnHandler, HandlerRegistry, MessageHandler, Route, handler_fn};
pub use self::status::ConsumerStatus;
pub use self::supervisor::{Job, JobOutcome, spawn_job, supervise};
