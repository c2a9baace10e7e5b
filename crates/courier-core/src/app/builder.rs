//! ConsumerBuilder - wiring plus start-up validation.
//!
//! # Fail-fast
//! - `expect_subjects()` declares which subjects the deployment must handle
//! - `build()` checks "expected ⊆ registered" and validates the config
//! - a missing handler is reported at start-up instead of as dead letters

use std::sync::Arc;

use crate::app::{Consumer, ConsumerConfig, HandlerRegistry, MessageHandler};
use crate::domain::{ConsumerError, Subject};
use crate::ports::{Clock, MessageBroker, SystemClock};

/// Builds a [`Consumer`].
///
/// # Example
/// ```ignore
/// let consumer = ConsumerBuilder::new(broker)
///     .config(ConsumerConfig::default().with_max_concurrency(8))
///     .handler("test", TestHandler)?
///     .expect_subjects(&["test"])
///     .build()?;
/// ```
pub struct ConsumerBuilder {
    broker: Arc<dyn MessageBroker>,
    config: ConsumerConfig,
    clock: Option<Arc<dyn Clock>>,
    registry: HandlerRegistry,
    expected_subjects: Option<Vec<String>>,
}

/// Errors raised while building a consumer.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing subjects: {0:?}. These subjects were expected but have no handler.")]
    MissingSubjects(Vec<String>),

    #[error(transparent)]
    Registry(#[from] ConsumerError),
}

impl ConsumerBuilder {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            config: ConsumerConfig::default(),
            clock: None,
            registry: HandlerRegistry::new(),
            expected_subjects: None,
        }
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for lock-renewal arithmetic. Defaults to [`SystemClock`].
    ///
    /// Should tell the same time as the broker that stamps lock expiries.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register a handler. Duplicate subjects fail immediately.
    pub fn handler(
        mut self,
        subject: impl Into<Subject>,
        handler: impl MessageHandler + 'static,
    ) -> Result<Self, ConsumerError> {
        self.registry.register(subject.into(), Arc::new(handler))?;
        Ok(self)
    }

    pub fn expect_subjects(mut self, subjects: &[&str]) -> Self {
        self.expected_subjects = Some(subjects.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Consumer, BuildError> {
        if let Some(expected) = &self.expected_subjects {
            let registered = self.registry.subjects();
            let missing: Vec<String> = expected
                .iter()
                .filter(|s| !registered.iter().any(|r| r.as_str() == s.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingSubjects(missing));
            }
        }
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        Ok(Consumer::from_parts(
            self.broker,
            self.config,
            clock,
            self.registry,
        ))
    }
}
