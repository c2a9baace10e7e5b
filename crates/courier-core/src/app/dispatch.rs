//! Dispatch loop: receive up to `capacity` messages, route, launch jobs.
//!
//! ```text
//! loop:
//!   cancelled?          -> Ok(())
//!   capacity == 0       -> sleep(poll_backoff), retry
//!   receive(capacity)   -> [cancellation] Ok(()) / [error] Err(Receive)
//!   empty batch         -> sleep(poll_backoff), retry
//!   for each message:
//!     cancelled         -> Ok(()), the rest stay locked until expiry
//!     no subject        -> reject("no subject")
//!     no handler        -> reject("no handler")
//!     matched + permit  -> spawn job
//!     matched, no slot  -> requeue (max_concurrency was lowered mid-batch)
//! ```
//!
//! The loop never waits for jobs. Draining is the consumer's concern.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{
    ConcurrencyGovernor, HandlerRegistry, Job, Lease, LeaseContext, MessageHandler, Route,
    spawn_job,
};
use crate::domain::{ConsumerError, Message};
use crate::ports::MessageBroker;

pub struct Dispatcher {
    broker: Arc<dyn MessageBroker>,
    handlers: Arc<HandlerRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    leases: Arc<LeaseContext>,
    poll_backoff: Duration,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        governor: Arc<ConcurrencyGovernor>,
        leases: Arc<LeaseContext>,
        poll_backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker: Arc::clone(leases.broker()),
            handlers,
            governor,
            leases,
            poll_backoff,
            cancel,
        }
    }

    /// Run until `cancel` fires (Ok) or the broker fails a receive (Err).
    pub async fn run(&self) -> Result<(), ConsumerError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let capacity = self.governor.capacity();
            if capacity == 0 {
                if !self.pause().await {
                    return Ok(());
                }
                continue;
            }

            // receive may block, so race it against cancellation.
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                received = self.broker.receive_messages(capacity) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(err) if err.is_cancellation() => return Ok(()),
                Err(err) => {
                    error!(
                        error = %err,
                        kind = ?err.kind(),
                        capacity,
                        "receive failed; stopping dispatch"
                    );
                    return Err(ConsumerError::Receive(err));
                }
            };

            if messages.is_empty() {
                if !self.pause().await {
                    return Ok(());
                }
                continue;
            }

            debug!(count = messages.len(), capacity, "received batch");
            let mut messages = messages.into_iter();
            while let Some(message) = messages.next() {
                if self.cancel.is_cancelled() {
                    debug!(
                        message_id = %message.id(),
                        remaining = messages.len() + 1,
                        "stopped mid-batch; leaving the rest to lock expiry"
                    );
                    return Ok(());
                }
                self.dispatch(message).await;
            }
        }
    }

    /// Sleep `poll_backoff`. False if cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_backoff) => true,
        }
    }

    async fn dispatch(&self, message: Message) {
        match self.handlers.route(&message) {
            Route::Matched(handler) => self.launch(handler, message).await,
            route => {
                let reason = route.reject_reason().unwrap_or("unroutable");
                self.reject_unroutable(message, reason).await;
            }
        }
    }

    async fn launch(&self, handler: Arc<dyn MessageHandler>, message: Message) {
        let lease = Lease::new(message, Arc::clone(&self.leases));

        let Some(permit) = self.governor.try_acquire() else {
            info!(
                message_id = %lease.id(),
                max_concurrency = self.governor.max_concurrency(),
                "no free slot; requeueing"
            );
            if let Err(err) = lease.requeue().await {
                warn!(message_id = %lease.id(), error = %err, "requeue failed");
            }
            return;
        };

        debug!(
            message_id = %lease.id(),
            subject = ?lease.subject().map(|s| s.as_str()),
            "dispatching"
        );
        // Handle dropped: the supervisor already logs the outcome.
        drop(spawn_job(Job {
            handler,
            lease,
            permit,
            cancel: self.cancel.child_token(),
        }));
    }

    async fn reject_unroutable(&self, message: Message, reason: &str) {
        let lease = Lease::new(message, Arc::clone(&self.leases));
        warn!(
            message_id = %lease.id(),
            subject = ?lease.subject().map(|s| s.as_str()),
            reason,
            "unroutable message; rejecting"
        );
        if let Err(err) = lease.reject(reason).await {
            warn!(message_id = %lease.id(), error = %err, "reject failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::app::{ConsumerConfig, handler_fn};
    use crate::domain::{BrokerError, Subject};
    use crate::impls::{BrokerOperation, InMemoryBroker};

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        governor: Arc<ConcurrencyGovernor>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(max_concurrency: usize) -> Self {
            Self {
                broker: Arc::new(InMemoryBroker::new()),
                governor: Arc::new(ConcurrencyGovernor::new(max_concurrency)),
                cancel: CancellationToken::new(),
            }
        }

        fn dispatcher_over(
            &self,
            broker: Arc<dyn MessageBroker>,
            handlers: HandlerRegistry,
        ) -> Dispatcher {
            let config = ConsumerConfig::default();
            let leases = Arc::new(LeaseContext::new(broker, self.broker.clock(), &config));
            Dispatcher::new(
                Arc::new(handlers),
                Arc::clone(&self.governor),
                leases,
                config.poll_backoff,
                self.cancel.clone(),
            )
        }

        fn dispatcher(&self, handlers: HandlerRegistry) -> Dispatcher {
            self.dispatcher_over(Arc::clone(&self.broker) as Arc<dyn MessageBroker>, handlers)
        }
    }

    fn acking() -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(|_cancel, lease: Lease| async move {
            let _ = lease.acknowledge().await;
        }))
    }

    async fn settle(broker: &InMemoryBroker, expected: usize) {
        for _ in 0..200 {
            let counts = broker.counts().await;
            if counts.acknowledged + counts.dead_lettered >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn cancelled_before_start_returns_ok() {
        let fx = Fixture::new(1);
        fx.cancel.cancel();
        assert!(fx.dispatcher(HandlerRegistry::new()).run().await.is_ok());
    }

    #[tokio::test]
    async fn unroutable_messages_are_rejected_not_dispatched() {
        let fx = Fixture::new(2);
        let mut handlers = HandlerRegistry::new();
        handlers.register(Subject::new("a"), acking()).unwrap();
        let dispatcher = fx.dispatcher(handlers);

        fx.broker.send(Some("ghost"), "1").await.unwrap();
        fx.broker.send(None, "2").await.unwrap();
        fx.broker.send(Some("a"), "3").await.unwrap();

        let run = tokio::spawn(async move { dispatcher.run().await });
        settle(&fx.broker, 3).await;
        fx.cancel.cancel();
        assert!(run.await.unwrap().is_ok());

        let mut reasons: Vec<String> = fx
            .broker
            .dead_letters()
            .await
            .into_iter()
            .map(|d| d.reason)
            .collect();
        reasons.sort();
        assert_eq!(reasons, vec!["no handler".to_string(), "no subject".to_string()]);
        assert_eq!(fx.broker.counts().await.acknowledged, 1);
    }

    #[tokio::test]
    async fn receive_failure_ends_loop_with_error() {
        let fx = Fixture::new(1);
        fx.broker
            .inject_failure(
                BrokerOperation::Receive,
                BrokerError::Transport("connection reset".into()),
            )
            .await;

        let err = fx.dispatcher(HandlerRegistry::new()).run().await.unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::Receive(BrokerError::Transport(ref m)) if m == "connection reset"
        ));
    }

    #[tokio::test]
    async fn cancellation_error_from_receive_is_a_clean_exit() {
        let fx = Fixture::new(1);
        fx.broker
            .inject_failure(BrokerOperation::Receive, BrokerError::Cancelled)
            .await;
        assert!(fx.dispatcher(HandlerRegistry::new()).run().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn full_governor_backs_off_without_receiving() {
        let fx = Fixture::new(1);
        let _held = fx.governor.try_acquire().unwrap();
        fx.broker.send(Some("a"), "1").await.unwrap();
        let dispatcher = fx.dispatcher(HandlerRegistry::new());

        let cancel = fx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        assert!(dispatcher.run().await.is_ok());

        let counts = fx.broker.counts().await;
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.locked, 0);
    }

    /// Lowers the governor ceiling between receive and dispatch.
    struct ShrinkingBroker {
        inner: Arc<InMemoryBroker>,
        governor: Arc<ConcurrencyGovernor>,
    }

    #[async_trait]
    impl MessageBroker for ShrinkingBroker {
        async fn receive_messages(&self, max_count: usize) -> Result<Vec<Message>, BrokerError> {
            let batch = self.inner.receive_messages(max_count).await?;
            self.governor.set_max_concurrency(1);
            Ok(batch)
        }

        async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
            self.inner.acknowledge(message).await
        }

        async fn requeue(&self, message: &Message) -> Result<(), BrokerError> {
            self.inner.requeue(message).await
        }

        async fn reject(&self, message: &Message, reason: &str) -> Result<(), BrokerError> {
            self.inner.reject(message, reason).await
        }

        async fn renew_lock(&self, message: &Message) -> Result<DateTime<Utc>, BrokerError> {
            self.inner.renew_lock(message).await
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn lowered_ceiling_requeues_the_overflow() {
        let fx = Fixture::new(3);
        let gate = CancellationToken::new();
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(
                Subject::new("a"),
                Arc::new(handler_fn({
                    let gate = gate.clone();
                    move |_cancel, lease: Lease| {
                        let gate = gate.clone();
                        async move {
                            gate.cancelled().await;
                            let _ = lease.acknowledge().await;
                        }
                    }
                })),
            )
            .unwrap();
        for body in ["1", "2", "3"] {
            fx.broker.send(Some("a"), body).await.unwrap();
        }

        let shrinking: Arc<dyn MessageBroker> = Arc::new(ShrinkingBroker {
            inner: Arc::clone(&fx.broker),
            governor: Arc::clone(&fx.governor),
        });
        let dispatcher = fx.dispatcher_over(shrinking, handlers);
        let run = tokio::spawn(async move { dispatcher.run().await });

        for _ in 0..200 {
            if fx.broker.counts().await.ready == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.governor.in_flight(), 1);
        assert_eq!(fx.broker.counts().await.ready, 2);

        fx.cancel.cancel();
        gate.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    /// Signals stop while the first rejection is in progress.
    struct StopOnRejectBroker {
        inner: Arc<InMemoryBroker>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl MessageBroker for StopOnRejectBroker {
        async fn receive_messages(&self, max_count: usize) -> Result<Vec<Message>, BrokerError> {
            self.inner.receive_messages(max_count).await
        }

        async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
            self.inner.acknowledge(message).await
        }

        async fn requeue(&self, message: &Message) -> Result<(), BrokerError> {
            self.inner.requeue(message).await
        }

        async fn reject(&self, message: &Message, reason: &str) -> Result<(), BrokerError> {
            self.cancel.cancel();
            self.inner.reject(message, reason).await
        }

        async fn renew_lock(&self, message: &Message) -> Result<DateTime<Utc>, BrokerError> {
            self.inner.renew_lock(message).await
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn stop_mid_batch_skips_remaining_messages() {
        let fx = Fixture::new(3);
        for body in ["1", "2", "3"] {
            fx.broker.send(Some("ghost"), body).await.unwrap();
        }

        let stopping: Arc<dyn MessageBroker> = Arc::new(StopOnRejectBroker {
            inner: Arc::clone(&fx.broker),
            cancel: fx.cancel.clone(),
        });
        let dispatcher = fx.dispatcher_over(stopping, HandlerRegistry::new());
        assert!(dispatcher.run().await.is_ok());

        let counts = fx.broker.counts().await;
        assert_eq!(counts.dead_lettered, 1);
        assert_eq!(counts.locked, 2);
        assert_eq!(counts.ready, 0);
    }
}
