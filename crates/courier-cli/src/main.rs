use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use courier_core::app::{
    ConsumerBuilder, ConsumerConfig, ConsumerStatus, Lease, MessageHandler, handler_fn,
};
use courier_core::impls::{BrokerCounts, InMemoryBroker};
use courier_core::ports::MessageBroker;

/// Demo settings, optionally loaded from a JSON file given as the first argument.
///
/// ```json
/// { "consumer": { "max_concurrency": 4 }, "long_test_secs": 45 }
/// ```
#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoSettings {
    consumer: ConsumerConfig,
    /// Broker lock duration
    lock_secs: u64,
    /// How long the `longTest` handler works (longer than the lock)
    long_test_secs: u64,
    /// Drain budget after a signal or an empty queue
    shutdown_grace_secs: u64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            consumer: ConsumerConfig::default().with_max_concurrency(4),
            lock_secs: 5,
            long_test_secs: 12,
            shutdown_grace_secs: 30,
        }
    }
}

fn load_settings(path: Option<String>) -> Result<DemoSettings, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(DemoSettings::default());
    };
    let raw = std::fs::read_to_string(&path)?;
    let settings: DemoSettings = serde_json::from_str(&raw)?;
    info!(%path, "loaded settings");
    Ok(settings)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

async fn test(_cancel: CancellationToken, lease: Lease) {
    info!(
        subject = ?lease.subject().map(|s| s.as_str()),
        body = %String::from_utf8_lossy(lease.body()),
        "test"
    );
    if let Err(err) = lease.acknowledge().await {
        warn!(error = %err, "acknowledge failed");
    }
}

async fn panic_test(_cancel: CancellationToken, _lease: Lease) {
    panic!("PANICING VIOLENTLY");
}

/// Works longer than the broker lock, keeping it alive meanwhile.
struct LongTest {
    work: Duration,
}

#[async_trait]
impl MessageHandler for LongTest {
    async fn handle(&self, cancel: CancellationToken, lease: Lease) {
        if let Err(err) = lease.keep_alive(cancel.clone()).await {
            warn!(message_id = %lease.id(), error = %err, "keep-alive failed to start");
            return;
        }
        info!(message_id = %lease.id(), work = ?self.work, "starting long test");

        tokio::select! {
            _ = cancel.cancelled() => {
                // Interrupted: hand the message back for another consumer.
                info!(message_id = %lease.id(), "cancelled; requeueing");
                if let Err(err) = lease.requeue().await {
                    warn!(error = %err, "requeue failed");
                }
            }
            _ = tokio::time::sleep(self.work) => {
                info!(
                    message_id = %lease.id(),
                    body = %String::from_utf8_lossy(lease.body()),
                    "long test done"
                );
                if let Err(err) = lease.acknowledge().await {
                    warn!(error = %err, "acknowledge failed");
                }
            }
        }
    }
}

/// Resolves on SIGINT / SIGTERM / SIGQUIT (ctrl-c elsewhere).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Resolves once nothing is queued, locked, or running.
async fn queue_drained(broker: &InMemoryBroker, in_flight: impl Fn() -> usize) {
    loop {
        let counts = broker.counts().await;
        if counts.ready == 0 && counts.locked == 0 && in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[derive(Debug, Serialize)]
struct DeadLetterView {
    subject: Option<String>,
    body: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct Summary {
    consumer: ConsumerStatus,
    broker: BrokerCounts,
    dead_letters: Vec<DeadLetterView>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let settings = load_settings(std::env::args().nth(1))?;

    // (A) broker and consumer
    let broker = Arc::new(
        InMemoryBroker::new().with_lock_duration(Duration::from_secs(settings.lock_secs)),
    );
    let consumer = Arc::new(
        ConsumerBuilder::new(Arc::clone(&broker) as Arc<dyn MessageBroker>)
            .config(settings.consumer)
            .clock(broker.clock())
            .handler("test", handler_fn(test))?
            .handler(
                "longTest",
                LongTest {
                    work: Duration::from_secs(settings.long_test_secs),
                },
            )?
            .handler("panicTest", handler_fn(panic_test))?
            .expect_subjects(&["test", "longTest", "panicTest"])
            .build()?,
    );

    // (B) producer: handled, unregistered, and subject-less messages
    for (subject, body) in [
        (Some("test"), "hello"),
        (Some("longTest"), "slow hello"),
        (Some("test"), "hello again"),
        (Some("panicTest"), "boom"),
        (Some("ghost"), "nobody listens"),
        (None, "no subject at all"),
    ] {
        let id = broker.send(subject, body).await?;
        info!(message_id = %id, ?subject, "sent");
    }

    // (C) start the consumer
    let runner = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        async move { consumer.run().await }
    });

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            info!("shutdown signal received");
        }
        _ = queue_drained(&broker, || consumer.in_flight()) => info!("queue drained"),
    }

    // (D) graceful shutdown, terminate if the drain runs out of time
    let grace = Duration::from_secs(settings.shutdown_grace_secs);
    let drained = consumer.shutdown(grace).await;
    if let Err(err) = runner.await? {
        error!(error = %err, "consumer run failed");
    }
    if let Err(err) = drained {
        warn!(error = %err, "drain incomplete; terminating");
        consumer.terminate().await?;
    }

    let summary = Summary {
        consumer: consumer.status(),
        broker: broker.counts().await,
        dead_letters: broker
            .dead_letters()
            .await
            .into_iter()
            .map(|d| DeadLetterView {
                subject: d.subject.map(|s| s.as_str().to_string()),
                body: String::from_utf8_lossy(&d.body).into_owned(),
                reason: d.reason,
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
