use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::Lease;
use crate::domain::{ConsumerError, Message, Subject};

/// A handler for one subject.
///
/// The handler gets no return channel: it settles the message through the
/// [`Lease`] (acknowledge / requeue / reject). A panic is caught by the job
/// supervisor and turns into a reject.
///
/// `cancel` is cancelled when the consumer stops; long-running handlers
/// should watch it and wind down.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, lease: Lease);
}

/// Adapter for plain async closures. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Lease) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, lease: Lease) {
        (self.f)(cancel, lease).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```ignore
/// consumer.register("test", handler_fn(|_cancel, lease| async move {
///     let _ = lease.acknowledge().await;
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, Lease) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler { f }
}

/// Where a received message goes.
pub enum Route {
    Matched(Arc<dyn MessageHandler>),
    NoSubject,
    NoHandler(Subject),
}

impl Route {
    /// Dead-letter reason for unroutable messages; `None` when matched.
    pub fn reject_reason(&self) -> Option<&'static str> {
        match self {
            Route::Matched(_) => None,
            Route::NoSubject => Some("no subject"),
            Route::NoHandler(_) => Some("no handler"),
        }
    }
}

/// Registry of handlers (subject -> handler).
///
/// Design:
/// - Mutated only while the consumer is idle (the consumer enforces this).
/// - Each run takes a clone; the dispatch loop reads it without locks.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Subject, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind `handler` to `subject`. A subject can be bound once.
    pub fn register(
        &mut self,
        subject: Subject,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumerError> {
        if self.handlers.contains_key(&subject) {
            return Err(ConsumerError::DuplicateSubject(subject));
        }
        self.handlers.insert(subject, handler);
        Ok(())
    }

    pub fn get(&self, subject: &Subject) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(subject)
    }

    /// Classify `message`. A miss is not an error here; the dispatch loop
    /// applies its unmatched-message policy.
    pub fn route(&self, message: &Message) -> Route {
        let Some(subject) = message.subject() else {
            return Route::NoSubject;
        };
        match self.handlers.get(subject) {
            Some(handler) => Route::Matched(Arc::clone(handler)),
            None => Route::NoHandler(subject.clone()),
        }
    }

    /// Registered subjects, sorted.
    pub fn subjects(&self) -> Vec<Subject> {
        let mut subjects: Vec<Subject> = self.handlers.keys().cloned().collect();
        subjects.sort();
        subjects
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
