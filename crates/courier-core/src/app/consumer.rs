//! Consumer - the public facade: register handlers, run, stop, drain.
//!
//! # Usage
//! ```ignore
//! let consumer = Arc::new(Consumer::new(broker));
//! consumer.register("test", handler_fn(|_cancel, lease| async move {
//!     let _ = lease.acknowledge().await;
//! }))?;
//!
//! let runner = tokio::spawn({
//!     let consumer = Arc::clone(&consumer);
//!     async move { consumer.run().await }
//! });
//! // ...
//! consumer.shutdown(Duration::from_secs(30)).await?;
//! ```
//!
//! `run` only returns the dispatch loop's result. In-flight jobs outlive it;
//! `wait` / `shutdown` are how a caller learns that they finished.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::config::validate_max_concurrency;
use crate::app::{
    ConcurrencyGovernor, ConsumerConfig, ConsumerStatus, Dispatcher, HandlerRegistry,
    LeaseContext, Lifecycle, MessageHandler, RunState,
};
use crate::domain::{BrokerError, ConsumerError, ConsumerId, Subject};
use crate::ports::{Clock, IdGenerator, MessageBroker, SystemClock, UlidGenerator};

pub struct Consumer {
    id: ConsumerId,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    registry: Mutex<HandlerRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    lifecycle: Lifecycle,
}

impl Consumer {
    /// Consumer with the default config and the system clock.
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self::from_parts(
            broker,
            ConsumerConfig::default(),
            Arc::new(SystemClock),
            HandlerRegistry::new(),
        )
    }

    pub fn with_config(
        broker: Arc<dyn MessageBroker>,
        config: ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;
        Ok(Self::from_parts(
            broker,
            config,
            Arc::new(SystemClock),
            HandlerRegistry::new(),
        ))
    }

    /// `config` must already be validated.
    pub(crate) fn from_parts(
        broker: Arc<dyn MessageBroker>,
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
        registry: HandlerRegistry,
    ) -> Self {
        let id = UlidGenerator::new(Arc::clone(&clock)).generate_consumer_id();
        Self {
            id,
            broker,
            clock,
            governor: Arc::new(ConcurrencyGovernor::new(config.max_concurrency)),
            config,
            registry: Mutex::new(registry),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn lock_registry(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `handler` to `subject`. Only allowed while Idle.
    pub fn register(
        &self,
        subject: impl Into<Subject>,
        handler: impl MessageHandler + 'static,
    ) -> Result<(), ConsumerError> {
        let subject = subject.into();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        self.lifecycle
            .when_idle(|| self.lock_registry().register(subject, handler))?
    }

    /// Receive and dispatch until stopped (`Ok`) or the broker fails a receive.
    ///
    /// Fails fast with `AlreadyRunning` if a run is active, and with
    /// `StaleJobs` if jobs of a previous run are still executing.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        let ticket = self.lifecycle.begin(|| self.governor.in_flight())?;

        // Registrations are frozen here: register() is refused while running.
        let handlers = Arc::new(self.lock_registry().clone());
        let leases = Arc::new(LeaseContext::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.clock),
            &self.config,
        ));
        info!(
            consumer_id = %self.id,
            subjects = handlers.len(),
            max_concurrency = self.governor.max_concurrency(),
            "consumer running"
        );

        let dispatcher = Dispatcher::new(
            handlers,
            Arc::clone(&self.governor),
            leases,
            self.config.poll_backoff,
            ticket.cancel_token().clone(),
        );
        let result = dispatcher.run().await;
        drop(ticket);

        match &result {
            Ok(()) => info!(
                consumer_id = %self.id,
                in_flight = self.governor.in_flight(),
                "consumer stopped"
            ),
            Err(err) => error!(
                consumer_id = %self.id,
                error = %err,
                kind = err.as_label(),
                "consumer run failed"
            ),
        }
        result
    }

    /// Cancel the running loop and every job token. Returns false unless Running.
    ///
    /// Jobs are not interrupted; they see cancellation through their token.
    /// The state is `Stopping` until the dispatch loop returns, and `register`
    /// and `run` answer `AlreadyRunning` until then. The loop checks the token
    /// between messages, so the window is at most one broker call (bounded by
    /// `settle_timeout`). Use [`terminate`](Self::terminate) to go Idle at once.
    pub fn stop(&self) -> bool {
        let stopped = self.lifecycle.stop();
        if stopped {
            info!(
                consumer_id = %self.id,
                in_flight = self.governor.in_flight(),
                "stop requested"
            );
        }
        stopped
    }

    /// Block until Idle with nothing in flight, or fail after `grace`.
    pub async fn wait(&self, grace: Duration) -> Result<(), ConsumerError> {
        match tokio::time::timeout(grace, self.drained()).await {
            Ok(()) => Ok(()),
            Err(_elapsed) => Err(ConsumerError::DrainTimeout {
                grace,
                in_flight: self.governor.in_flight(),
            }),
        }
    }

    /// Like [`wait`](Self::wait), bounded by `cancel` instead of a duration.
    /// Returns true once drained, false if `cancel` fired first.
    pub async fn wait_until(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = self.drained() => true,
            _ = cancel.cancelled() => false,
        }
    }

    async fn drained(&self) {
        while !self.is_drained() {
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
    }

    /// `stop` then `wait(grace)`.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ConsumerError> {
        self.stop();
        self.wait(grace).await
    }

    /// Go Idle immediately and close the broker.
    ///
    /// In-flight jobs keep running; their settlements fail once the broker is
    /// closed.
    pub async fn terminate(&self) -> Result<(), BrokerError> {
        let was_active = self.lifecycle.force_idle();
        info!(
            consumer_id = %self.id,
            was_active,
            in_flight = self.governor.in_flight(),
            "terminating consumer"
        );
        match tokio::time::timeout(self.config.settle_timeout, self.broker.close()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(BrokerError::Timeout(self.config.settle_timeout)),
        }
    }

    /// Change the concurrency ceiling; takes effect on the next receive.
    pub fn set_max_concurrency(&self, max_concurrency: usize) -> Result<(), ConsumerError> {
        validate_max_concurrency(max_concurrency)?;
        self.governor.set_max_concurrency(max_concurrency);
        info!(consumer_id = %self.id, max_concurrency, "max concurrency updated");
        Ok(())
    }

    pub fn max_concurrency(&self) -> usize {
        self.governor.max_concurrency()
    }

    pub fn in_flight(&self) -> usize {
        self.governor.in_flight()
    }

    pub fn capacity(&self) -> usize {
        self.governor.capacity()
    }

    pub fn state(&self) -> RunState {
        self.lifecycle.state()
    }

    pub fn is_drained(&self) -> bool {
        self.state() == RunState::Idle && self.in_flight() == 0
    }

    pub fn status(&self) -> ConsumerStatus {
        let (max_concurrency, in_flight) = self.governor.snapshot();
        ConsumerStatus {
            consumer_id: self.id,
            state: self.state(),
            in_flight,
            max_concurrency,
            capacity: max_concurrency.saturating_sub(in_flight),
            subjects: self.lock_registry().subjects(),
        }
    }
}
