//! In-memory peek-lock broker.
//!
//! Behaves like a single queue on a real broker:
//! - `receive_messages` hands out messages under a time-limited lock and waits
//!   while nothing is available
//! - settlement requires a live lock (`LockLost` otherwise)
//! - expired locks are reclaimed and the message is redelivered with an
//!   incremented delivery count, or dead-lettered past `max_delivery_count`
//!
//! Every operation is appended to a timestamped event history, and one-shot
//! failures can be injected per operation. Both exist for tests and demos.
//! The history keeps the most recent `event_capacity` entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use crate::domain::{BrokerError, Message, MessageId, Subject};
use crate::ports::{Clock, IdGenerator, MessageBroker, MonotonicClock, UlidGenerator};

const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;
const DEFAULT_EVENT_CAPACITY: usize = 10_000;
const MAX_DELIVERY_REASON: &str = "max delivery count exceeded";

/// Operations that can be made to fail with [`InMemoryBroker::inject_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    Receive,
    Acknowledge,
    Requeue,
    Reject,
    RenewLock,
}

/// What happened to a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEventKind {
    Sent,
    Received { delivery_count: u32 },
    Acknowledged,
    Requeued,
    Rejected { reason: String },
    LockRenewed { locked_until: DateTime<Utc> },
    LockExpired,
}

impl BrokerEventKind {
    /// Acknowledged, requeued or rejected by a receiver.
    pub fn is_settlement(&self) -> bool {
        matches!(
            self,
            BrokerEventKind::Acknowledged | BrokerEventKind::Requeued | BrokerEventKind::Rejected { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerEvent {
    pub at: DateTime<Utc>,
    pub message_id: MessageId,
    #[serde(flatten)]
    pub kind: BrokerEventKind,
}

/// A message in the dead-letter side channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub subject: Option<Subject>,
    pub body: Vec<u8>,
    pub reason: String,
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerCounts {
    pub ready: usize,
    pub locked: usize,
    pub acknowledged: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone)]
struct Stored {
    id: MessageId,
    subject: Option<Subject>,
    body: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug)]
struct Locked {
    stored: Stored,
    locked_until: DateTime<Utc>,
}

struct BrokerState {
    ready: VecDeque<Stored>,
    locked: HashMap<MessageId, Locked>,
    dead_letters: Vec<DeadLetter>,
    acknowledged: usize,
    events: VecDeque<BrokerEvent>,
    event_capacity: usize,
    failures: HashMap<BrokerOperation, VecDeque<BrokerError>>,
    closed: bool,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            locked: HashMap::new(),
            dead_letters: Vec::new(),
            acknowledged: 0,
            events: VecDeque::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            failures: HashMap::new(),
            closed: false,
        }
    }

    fn record(&mut self, at: DateTime<Utc>, message_id: MessageId, kind: BrokerEventKind) {
        if self.event_capacity == 0 {
            return;
        }
        while self.events.len() >= self.event_capacity {
            self.events.pop_front();
        }
        self.events.push_back(BrokerEvent {
            at,
            message_id,
            kind,
        });
    }

    /// Closed check first, then any injected failure for `op`.
    fn check(&mut self, op: BrokerOperation) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Put a message back in line, or dead-letter it once it used up its deliveries.
    fn redeliver(&mut self, stored: Stored, max_delivery_count: u32) {
        if stored.delivery_count >= max_delivery_count {
            self.dead_letter(stored, MAX_DELIVERY_REASON.to_string());
        } else {
            self.ready.push_back(stored);
        }
    }

    fn dead_letter(&mut self, stored: Stored, reason: String) {
        self.dead_letters.push(DeadLetter {
            message_id: stored.id,
            subject: stored.subject,
            body: stored.body,
            reason,
            delivery_count: stored.delivery_count,
        });
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>, max_delivery_count: u32) {
        let mut expired: Vec<MessageId> = self
            .locked
            .iter()
            .filter(|(_, l)| l.locked_until <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in expired {
            self.expire(id, now, max_delivery_count);
        }
    }

    fn expire(&mut self, id: MessageId, now: DateTime<Utc>, max_delivery_count: u32) {
        if let Some(locked) = self.locked.remove(&id) {
            self.record(now, id, BrokerEventKind::LockExpired);
            self.redeliver(locked.stored, max_delivery_count);
        }
    }

    /// Borrow the live lock held by this delivery of `message`.
    ///
    /// A lock belongs to one delivery: a message from an earlier delivery is
    /// `LockLost` even if the same id is locked again. An expired lock is
    /// reclaimed on the spot.
    fn live_lock(
        &mut self,
        message: &Message,
        now: DateTime<Utc>,
        max_delivery_count: u32,
    ) -> Result<&mut Locked, BrokerError> {
        let id = message.id();
        let current = self
            .locked
            .get(&id)
            .map(|l| (l.stored.delivery_count, l.locked_until > now));
        match current {
            Some((delivery, _)) if delivery != message.delivery_count() => {
                Err(BrokerError::LockLost(id))
            }
            Some((_, true)) => self.locked.get_mut(&id).ok_or(BrokerError::LockLost(id)),
            Some((_, false)) => {
                self.expire(id, now, max_delivery_count);
                Err(BrokerError::LockLost(id))
            }
            None if self.ready.iter().any(|s| s.id == id) => Err(BrokerError::LockLost(id)),
            None => Err(BrokerError::UnknownMessage(id)),
        }
    }

    fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        self.locked.values().map(|l| l.locked_until).min()
    }
}

/// In-memory broker for tests and local runs.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    lock_duration: Duration,
    max_delivery_count: u32,
}

impl InMemoryBroker {
    /// 30s locks, 10 deliveries, 10k events of history, [`MonotonicClock`].
    pub fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        Self {
            state: Mutex::new(BrokerState::new()),
            notify: Notify::new(),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            lock_duration: DEFAULT_LOCK_DURATION,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = UlidGenerator::new(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count.max(1);
        self
    }

    /// Keep at most `capacity` events, dropping the oldest. Zero disables the history.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let state = self.state.get_mut();
        state.event_capacity = capacity;
        while state.events.len() > capacity {
            state.events.pop_front();
        }
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn lock_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lock = chrono::Duration::from_std(self.lock_duration).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(lock).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Enqueue a message (producer side).
    pub async fn send(
        &self,
        subject: Option<&str>,
        body: impl Into<Vec<u8>>,
    ) -> Result<MessageId, BrokerError> {
        let id = self.ids.generate_message_id();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.ready.push_back(Stored {
                id,
                subject: subject.map(Subject::from),
                body: body.into(),
                delivery_count: 0,
            });
            state.record(self.clock.now(), id, BrokerEventKind::Sent);
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Make the next call of `op` fail with `err`. Failures queue up per operation.
    pub async fn inject_failure(&self, op: BrokerOperation, err: BrokerError) {
        let mut state = self.state.lock().await;
        state.failures.entry(op).or_default().push_back(err);
        drop(state);
        // A blocked receive must re-check so an injected receive failure surfaces.
        self.notify.notify_waiters();
    }

    pub async fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().await.events.iter().cloned().collect()
    }

    pub async fn clear_events(&self) {
        self.state.lock().await.events.clear();
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    pub async fn counts(&self) -> BrokerCounts {
        let state = self.state.lock().await;
        BrokerCounts {
            ready: state.ready.len(),
            locked: state.locked.len(),
            acknowledged: state.acknowledged,
            dead_lettered: state.dead_letters.len(),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    fn take_batch(&self, state: &mut BrokerState, max_count: usize, now: DateTime<Utc>) -> Vec<Message> {
        let locked_until = self.lock_expiry(now);
        let mut batch = Vec::with_capacity(max_count.min(state.ready.len()));
        while batch.len() < max_count {
            let Some(mut stored) = state.ready.pop_front() else {
                break;
            };
            stored.delivery_count += 1;
            let message = Message::new(stored.id, stored.subject.clone(), stored.body.clone(), locked_until)
                .with_delivery_count(stored.delivery_count);
            state.record(
                now,
                stored.id,
                BrokerEventKind::Received {
                    delivery_count: stored.delivery_count,
                },
            );
            state.locked.insert(
                stored.id,
                Locked {
                    stored,
                    locked_until,
                },
            );
            batch.push(message);
        }
        batch
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn receive_messages(&self, max_count: usize) -> Result<Vec<Message>, BrokerError> {
        loop {
            // Register interest before inspecting state so a send in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.state.lock().await;
                state.check(BrokerOperation::Receive)?;
                let now = self.clock.now();
                state.reclaim_expired(now, self.max_delivery_count);

                if max_count == 0 {
                    return Ok(Vec::new());
                }
                let batch = self.take_batch(&mut state, max_count, now);
                if !batch.is_empty() {
                    return Ok(batch);
                }
                state
                    .earliest_expiry()
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            };

            match next_expiry {
                Some(wait) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check(BrokerOperation::Acknowledge)?;
        let now = self.clock.now();
        let id = message.id();
        state.live_lock(message, now, self.max_delivery_count)?;
        state.locked.remove(&id);
        state.acknowledged += 1;
        state.record(now, id, BrokerEventKind::Acknowledged);
        Ok(())
    }

    async fn requeue(&self, message: &Message) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.check(BrokerOperation::Requeue)?;
            let now = self.clock.now();
            let id = message.id();
            state.live_lock(message, now, self.max_delivery_count)?;
            if let Some(locked) = state.locked.remove(&id) {
                state.record(now, id, BrokerEventKind::Requeued);
                state.redeliver(locked.stored, self.max_delivery_count);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, message: &Message, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check(BrokerOperation::Reject)?;
        let now = self.clock.now();
        let id = message.id();
        state.live_lock(message, now, self.max_delivery_count)?;
        if let Some(locked) = state.locked.remove(&id) {
            state.record(
                now,
                id,
                BrokerEventKind::Rejected {
                    reason: reason.to_string(),
                },
            );
            state.dead_letter(locked.stored, reason.to_string());
        }
        Ok(())
    }

    async fn renew_lock(&self, message: &Message) -> Result<DateTime<Utc>, BrokerError> {
        let mut state = self.state.lock().await;
        state.check(BrokerOperation::RenewLock)?;
        let now = self.clock.now();
        let id = message.id();
        let locked_until = self.lock_expiry(now);
        state.live_lock(message, now, self.max_delivery_count)?.locked_until = locked_until;
        state.record(now, id, BrokerEventKind::LockRenewed { locked_until });
        Ok(locked_until)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn broker(lock_duration: Duration) -> InMemoryBroker {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        InMemoryBroker::new()
            .with_clock(Arc::new(MonotonicClock::anchored_at(origin)))
            .with_lock_duration(lock_duration)
    }

    #[tokio::test(start_paused = true)]
    async fn receive_is_bounded_by_max_count() {
        let broker = broker(Duration::from_secs(30));
        for s in ["a", "b", "c"] {
            broker.send(Some(s), s).await.unwrap();
        }

        let batch = broker.receive_messages(2).await.unwrap();
        let subjects: Vec<&str> = batch
            .iter()
            .map(|m| m.subject().unwrap().as_str())
            .collect();
        assert_eq!(subjects, vec!["a", "b"]);

        let counts = broker.counts().await;
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.locked, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_for_send() {
        let broker = Arc::new(broker(Duration::from_secs(30)));

        let receiver = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.receive_messages(5).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        broker.send(None, "late").await.unwrap();

        let batch = receiver.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].subject().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_is_redelivered() {
        let broker = broker(Duration::from_secs(30));
        let id = broker.send(Some("a"), "x").await.unwrap();

        let first = broker.receive_messages(1).await.unwrap().remove(0);
        assert_eq!(first.delivery_count(), 1);

        // Blocks until the lock expires at 30s, then redelivers.
        let second = broker.receive_messages(1).await.unwrap().remove(0);
        assert_eq!(second.id(), id);
        assert_eq!(second.delivery_count(), 2);

        let expired = broker
            .events()
            .await
            .into_iter()
            .filter(|e| e.kind == BrokerEventKind::LockExpired)
            .count();
        assert_eq!(expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settling_after_expiry_is_lock_lost() {
        let broker = broker(Duration::from_secs(30));
        broker.send(Some("a"), "x").await.unwrap();
        let message = broker.receive_messages(1).await.unwrap().remove(0);

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            broker.acknowledge(&message).await,
            Err(BrokerError::LockLost(message.id()))
        );
        assert_eq!(broker.counts().await.ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_delivery_cannot_settle_redelivered_copy() {
        let broker = broker(Duration::from_secs(30));
        broker.send(Some("a"), "x").await.unwrap();
        let first = broker.receive_messages(1).await.unwrap().remove(0);
        let second = broker.receive_messages(1).await.unwrap().remove(0);
        assert_eq!(second.delivery_count(), 2);

        assert_eq!(
            broker.renew_lock(&first).await,
            Err(BrokerError::LockLost(first.id()))
        );
        assert_eq!(
            broker.acknowledge(&first).await,
            Err(BrokerError::LockLost(first.id()))
        );
        assert_eq!(broker.counts().await.locked, 1);

        assert_eq!(broker.acknowledge(&second).await, Ok(()));
        assert_eq!(broker.counts().await.acknowledged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_past_max_delivery_dead_letters() {
        let broker = broker(Duration::from_secs(30)).with_max_delivery_count(2);
        broker.send(Some("a"), "x").await.unwrap();

        let m = broker.receive_messages(1).await.unwrap().remove(0);
        broker.requeue(&m).await.unwrap();
        let m = broker.receive_messages(1).await.unwrap().remove(0);
        broker.requeue(&m).await.unwrap();

        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, MAX_DELIVERY_REASON);
        assert_eq!(dead[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn event_history_keeps_most_recent() {
        let broker = InMemoryBroker::new().with_event_capacity(3);
        let mut ids = Vec::new();
        for body in ["a", "b", "c", "d", "e"] {
            ids.push(broker.send(Some("s"), body).await.unwrap());
        }

        let kept: Vec<MessageId> = broker.events().await.iter().map(|e| e.message_id).collect();
        assert_eq!(kept, ids[2..].to_vec());

        broker.clear_events().await;
        assert!(broker.events().await.is_empty());
        assert_eq!(broker.counts().await.ready, 5);
    }

    #[tokio::test]
    async fn zero_event_capacity_records_nothing() {
        let broker = InMemoryBroker::new().with_event_capacity(0);
        broker.send(Some("s"), "x").await.unwrap();
        assert!(broker.events().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn injected_failure_fires_once() {
        let broker = broker(Duration::from_secs(30));
        broker.send(Some("a"), "x").await.unwrap();
        broker
            .inject_failure(BrokerOperation::Receive, BrokerError::Transport("down".into()))
            .await;

        assert_eq!(
            broker.receive_messages(1).await,
            Err(BrokerError::Transport("down".into()))
        );
        assert_eq!(broker.receive_messages(1).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_receiver_and_fails_calls() {
        let broker = Arc::new(broker(Duration::from_secs(30)));
        let receiver = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.receive_messages(1).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.close().await.unwrap();

        assert_eq!(receiver.await.unwrap(), Err(BrokerError::Closed));
        assert_eq!(broker.send(Some("a"), "x").await, Err(BrokerError::Closed));
    }

    #[tokio::test]
    async fn unknown_message_is_reported() {
        let broker = InMemoryBroker::new();
        let stray = Message::new(MessageId::generate(), None, Vec::new(), Utc::now());
        assert_eq!(
            broker.acknowledge(&stray).await,
            Err(BrokerError::UnknownMessage(stray.id()))
        );
    }
}
