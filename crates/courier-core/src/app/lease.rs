//! Lease: the consumer's handle on one received message.
//!
//! A lease owns the message's disposition. The first successful settlement
//! (acknowledge / requeue / reject) wins and every later call is a no-op, so
//! the handler and the fault boundary may race to settle the same message.
//!
//! ```text
//!   dispatch loop ──► Lease::new ──► handler(cancel, lease.clone())
//!                                      │
//!                                      ├─ keep_alive(cancel) ──► renewal task
//!                                      │                           (sleeps until
//!                                      │                            expiry - leeway)
//!                                      └─ acknowledge / requeue / reject
//!                                             │
//!                                             └─► settled ──► renewal task exits
//! ```
//!
//! ## Rules
//! - Disposition changes only after the broker confirmed the call.
//! - Settlement and renewal hold the state mutex across the broker round-trip,
//!   so no renew is ever issued after a settlement took effect.
//! - A renewal failure ends the keep-alive loop; the message is left to the
//!   handler or to natural lock expiry.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::ConsumerConfig;
use crate::domain::{
    BrokerError, Disposition, LeaseOperation, Message, MessageId, SettlementError, Subject,
};
use crate::ports::{Clock, MessageBroker};

/// Everything a lease needs besides its message. Shared by all leases of a run.
pub struct LeaseContext {
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    lock_leeway: Duration,
    settle_timeout: Duration,
}

impl LeaseContext {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        clock: Arc<dyn Clock>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            clock,
            lock_leeway: config.lock_leeway,
            settle_timeout: config.settle_timeout,
        }
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn settle_timeout(&self) -> Duration {
        self.settle_timeout
    }

    /// Run one broker round-trip bounded by `settle_timeout`.
    pub async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        match tokio::time::timeout(self.settle_timeout, call).await {
            Ok(result) => result,
            Err(_elapsed) => Err(BrokerError::Timeout(self.settle_timeout)),
        }
    }
}

/// Settling calls, with the data each one carries.
#[derive(Clone, Copy)]
enum Settle<'a> {
    Acknowledge,
    Requeue,
    Reject(&'a str),
}

impl Settle<'_> {
    fn operation(self) -> LeaseOperation {
        match self {
            Settle::Acknowledge => LeaseOperation::Acknowledge,
            Settle::Requeue => LeaseOperation::Requeue,
            Settle::Reject(_) => LeaseOperation::Reject,
        }
    }
}

#[derive(Debug)]
struct LeaseState {
    disposition: Disposition,
    locked_until: DateTime<Utc>,
}

struct LeaseInner {
    message: Message,
    context: Arc<LeaseContext>,
    state: Mutex<LeaseState>,
    /// Cancelled once a disposition is recorded; wakes the renewal task.
    settled: CancellationToken,
    renewal_active: AtomicBool,
}

/// Handle on one received message. Cloning is cheap and shares the state.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    pub fn new(message: Message, context: Arc<LeaseContext>) -> Self {
        let locked_until = message.locked_until();
        Self {
            inner: Arc::new(LeaseInner {
                message,
                context,
                state: Mutex::new(LeaseState {
                    disposition: Disposition::Pending,
                    locked_until,
                }),
                settled: CancellationToken::new(),
                renewal_active: AtomicBool::new(false),
            }),
        }
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn id(&self) -> MessageId {
        self.inner.message.id()
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.inner.message.subject()
    }

    pub fn body(&self) -> &[u8] {
        self.inner.message.body()
    }

    pub async fn disposition(&self) -> Disposition {
        self.inner.state.lock().await.disposition
    }

    /// Lock expiry as of the last successful renewal (or receipt).
    pub async fn locked_until(&self) -> DateTime<Utc> {
        self.inner.state.lock().await.locked_until
    }

    /// True once a terminal disposition has been recorded.
    pub fn is_settled(&self) -> bool {
        self.inner.settled.is_cancelled()
    }

    /// True while a keep-alive renewal task is scheduled for this lease.
    pub fn renewal_active(&self) -> bool {
        self.inner.renewal_active.load(Ordering::Acquire)
    }

    /// Complete the message. No-op if already settled.
    pub async fn acknowledge(&self) -> Result<(), SettlementError> {
        self.settle(Settle::Acknowledge).await
    }

    /// Give the message back for redelivery. No-op if already settled.
    pub async fn requeue(&self) -> Result<(), SettlementError> {
        self.settle(Settle::Requeue).await
    }

    /// Dead-letter the message with `reason`. No-op if already settled.
    pub async fn reject(&self, reason: &str) -> Result<(), SettlementError> {
        self.settle(Settle::Reject(reason)).await
    }

    /// Extend the broker lock without touching the disposition.
    ///
    /// Fails with [`SettlementError::AlreadySettled`] once the message is settled,
    /// and with the broker's `LockLost` if the lock already expired.
    pub async fn renew_lock(&self) -> Result<DateTime<Utc>, SettlementError> {
        let operation = LeaseOperation::RenewLock;
        let mut state = self.inner.state.lock().await;
        if state.disposition.is_terminal() {
            return Err(SettlementError::AlreadySettled {
                operation,
                message_id: self.id(),
                disposition: state.disposition,
            });
        }

        let context = &self.inner.context;
        let locked_until = context
            .bounded(context.broker.renew_lock(&self.inner.message))
            .await
            .map_err(|source| SettlementError::Broker {
                operation,
                message_id: self.id(),
                source,
            })?;
        state.locked_until = locked_until;
        Ok(locked_until)
    }

    /// Renew now, then keep renewing `lock_leeway` before each expiry until the
    /// lease is settled or `cancel` fires.
    ///
    /// Only one renewal task runs per lease; a second call just renews once.
    pub async fn keep_alive(&self, cancel: CancellationToken) -> Result<(), SettlementError> {
        self.renew_lock().await?;

        if self.inner.renewal_active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let lease = self.clone();
        tokio::spawn(async move {
            lease.renewal_loop(cancel).await;
            lease.inner.renewal_active.store(false, Ordering::Release);
        });
        Ok(())
    }

    async fn renewal_loop(&self, cancel: CancellationToken) {
        let context = &self.inner.context;
        loop {
            let delay = {
                let state = self.inner.state.lock().await;
                renewal_delay(state.locked_until, context.clock.now(), context.lock_leeway)
            };

            tokio::select! {
                biased;
                _ = self.inner.settled.cancelled() => return,
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.renew_lock().await {
                Ok(locked_until) => {
                    debug!(message_id = %self.id(), %locked_until, "lock renewed");
                }
                Err(SettlementError::AlreadySettled { .. }) => return,
                Err(err) => {
                    warn!(
                        message_id = %self.id(),
                        error = %err,
                        kind = ?err.kind(),
                        "lock renewal failed; keep-alive stopped"
                    );
                    return;
                }
            }
        }
    }

    async fn settle(&self, settle: Settle<'_>) -> Result<(), SettlementError> {
        let operation = settle.operation();
        let mut state = self.inner.state.lock().await;
        if state.disposition.is_terminal() {
            debug!(
                message_id = %self.id(),
                %operation,
                disposition = %state.disposition,
                "message already settled; ignoring"
            );
            return Ok(());
        }

        let context = &self.inner.context;
        let broker = &context.broker;
        let message = &self.inner.message;
        let result = match settle {
            Settle::Acknowledge => context.bounded(broker.acknowledge(message)).await,
            Settle::Requeue => context.bounded(broker.requeue(message)).await,
            Settle::Reject(reason) => context.bounded(broker.reject(message, reason)).await,
        };
        result.map_err(|source| SettlementError::Broker {
            operation,
            message_id: self.id(),
            source,
        })?;

        if let Some(disposition) = operation.disposition() {
            state.disposition = disposition;
        }
        self.inner.settled.cancel();
        debug!(message_id = %self.id(), disposition = %state.disposition, "message settled");
        Ok(())
    }
}

/// How long to sleep before the next renewal.
///
/// `locked_until - now - leeway`; when the remaining lock time does not exceed
/// the leeway, half the remaining time. Never negative.
pub fn renewal_delay(locked_until: DateTime<Utc>, now: DateTime<Utc>, leeway: Duration) -> Duration {
    let remaining = (locked_until - now).to_std().unwrap_or(Duration::ZERO);
    match remaining.checked_sub(leeway) {
        Some(delay) if !delay.is_zero() => delay,
        _ => remaining / 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{BrokerEventKind, BrokerOperation, InMemoryBroker};
    use crate::ports::MonotonicClock;
    use chrono::TimeZone;
    use rstest::rstest;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        context: Arc<LeaseContext>,
        origin: DateTime<Utc>,
    }

    fn fixture(lock_duration: Duration) -> Fixture {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::anchored_at(origin));
        let broker = Arc::new(
            InMemoryBroker::new()
                .with_clock(Arc::clone(&clock))
                .with_lock_duration(lock_duration),
        );
        let config = ConsumerConfig::default().with_lock_leeway(Duration::from_secs(5));
        let context = Arc::new(LeaseContext::new(
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            clock,
            &config,
        ));
        Fixture {
            broker,
            context,
            origin,
        }
    }

    impl Fixture {
        async fn lease(&self) -> Lease {
            self.broker.send(Some("a"), "payload").await.unwrap();
            let mut batch = self.broker.receive_messages(1).await.unwrap();
            Lease::new(batch.remove(0), Arc::clone(&self.context))
        }

        /// Seconds since origin of each lock renewal the broker saw.
        async fn renewal_offsets(&self) -> Vec<i64> {
            self.broker
                .events()
                .await
                .into_iter()
                .filter(|e| matches!(e.kind, BrokerEventKind::LockRenewed { .. }))
                .map(|e| (e.at - self.origin).num_seconds())
                .collect()
        }

        async fn settlement_count(&self) -> usize {
            self.broker
                .events()
                .await
                .into_iter()
                .filter(|e| e.kind.is_settlement())
                .count()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_settlement_wins() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        lease.acknowledge().await.unwrap();
        lease.requeue().await.unwrap();
        lease.reject("late").await.unwrap();
        lease.acknowledge().await.unwrap();

        assert_eq!(lease.disposition().await, Disposition::Acknowledged);
        assert!(lease.is_settled());
        assert_eq!(fx.settlement_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settlement_takes_effect_once() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        let mut joins = Vec::new();
        for i in 0..12 {
            let lease = lease.clone();
            joins.push(tokio::spawn(async move {
                match i % 3 {
                    0 => lease.acknowledge().await,
                    1 => lease.requeue().await,
                    _ => lease.reject("racing").await,
                }
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        assert!(lease.disposition().await.is_terminal());
        assert_eq!(fx.settlement_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_settlement_keeps_pending() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;
        fx.broker
            .inject_failure(BrokerOperation::Acknowledge, BrokerError::Transport("reset".into()))
            .await;

        let err = lease.acknowledge().await.unwrap_err();
        assert_eq!(err.operation(), LeaseOperation::Acknowledge);
        assert_eq!(lease.disposition().await, Disposition::Pending);
        assert!(!lease.is_settled());

        lease.acknowledge().await.unwrap();
        assert_eq!(lease.disposition().await, Disposition::Acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_dead_letters_with_reason() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        lease.reject("malformed").await.unwrap();

        let dead = fx.broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "malformed");
        assert_eq!(dead[0].message_id, lease.id());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_after_settlement_fails() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;
        lease.requeue().await.unwrap();

        let err = lease.renew_lock().await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::AlreadySettled {
                disposition: Disposition::Requeued,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_after_lock_expiry_reports_lock_lost() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        tokio::time::sleep(Duration::from_secs(31)).await;

        let err = lease.renew_lock().await.unwrap_err();
        assert_eq!(err.broker_error(), Some(&BrokerError::LockLost(lease.id())));
        assert_eq!(lease.disposition().await, Disposition::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_renews_leeway_before_expiry() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        lease.keep_alive(CancellationToken::new()).await.unwrap();
        assert!(lease.renewal_active());

        tokio::time::sleep(Duration::from_secs(60)).await;
        lease.acknowledge().await.unwrap();

        assert_eq!(fx.renewal_offsets().await, vec![0, 25, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_stops_after_acknowledge() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        lease.keep_alive(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        lease.acknowledge().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(fx.renewal_offsets().await, vec![0]);
        assert!(!lease.renewal_active());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_stops_on_cancel() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;
        let cancel = CancellationToken::new();

        lease.keep_alive(cancel.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(fx.renewal_offsets().await, vec![0]);
        assert!(!lease.renewal_active());
        assert_eq!(lease.disposition().await, Disposition::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_gives_up_after_renewal_failure() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        lease.keep_alive(CancellationToken::new()).await.unwrap();
        fx.broker
            .inject_failure(BrokerOperation::RenewLock, BrokerError::Transport("reset".into()))
            .await;

        tokio::time::sleep(Duration::from_secs(90)).await;

        // Only the immediate renewal succeeded; the failed one at 25s ended the loop.
        assert_eq!(fx.renewal_offsets().await, vec![0]);
        assert!(!lease.renewal_active());
        assert_eq!(lease.disposition().await, Disposition::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn second_keep_alive_does_not_spawn_another_loop() {
        let fx = fixture(Duration::from_secs(30));
        let lease = fx.lease().await;

        lease.keep_alive(CancellationToken::new()).await.unwrap();
        lease.keep_alive(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(26)).await;
        lease.acknowledge().await.unwrap();

        assert_eq!(fx.renewal_offsets().await, vec![0, 0, 25]);
    }

    #[rstest]
    #[case::normal(30, 5, Duration::from_secs(25))]
    #[case::inside_leeway(4, 5, Duration::from_secs(2))]
    #[case::exactly_leeway(5, 5, Duration::from_millis(2500))]
    #[case::expired(-3, 5, Duration::ZERO)]
    fn renewal_delay_cases(#[case] remaining_secs: i64, #[case] leeway_secs: u64, #[case] expected: Duration) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let locked_until = now + chrono::Duration::seconds(remaining_secs);
        assert_eq!(
            renewal_delay(locked_until, now, Duration::from_secs(leeway_secs)),
            expected
        );
    }
}
