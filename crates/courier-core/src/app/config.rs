//! Consumer configuration.
//!
//! Durations are (de)serialized as integer milliseconds so that a config file
//! reads `"poll_backoff": 100` rather than a `{secs, nanos}` object.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConsumerError;

/// Settings for one [`Consumer`](crate::app::Consumer).
///
/// ## Field semantics
/// - `max_concurrency`: ceiling on simultaneously running handlers (min 1)
/// - `poll_backoff`: sleep when saturated or when a receive returned nothing
/// - `drain_poll_interval`: how often `wait` re-checks for a drained consumer
/// - `settle_timeout`: bound on every settle/renew round-trip
/// - `lock_leeway`: how long before lock expiry a keep-alive renews
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub max_concurrency: usize,

    #[serde(with = "duration_ms")]
    pub poll_backoff: Duration,

    #[serde(with = "duration_ms")]
    pub drain_poll_interval: Duration,

    #[serde(with = "duration_ms")]
    pub settle_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub lock_leeway: Duration,
}

impl ConsumerConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_lock_leeway(mut self, lock_leeway: Duration) -> Self {
        self.lock_leeway = lock_leeway;
        self
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        validate_max_concurrency(self.max_concurrency)?;
        if self.poll_backoff.is_zero() {
            return Err(ConsumerError::InvalidConfig(
                "poll_backoff must be greater than zero".to_string(),
            ));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(ConsumerError::InvalidConfig(
                "drain_poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_max_concurrency(max_concurrency: usize) -> Result<(), ConsumerError> {
    if max_concurrency == 0 || max_concurrency > u32::MAX as usize {
        return Err(ConsumerError::InvalidConfig(format!(
            "max_concurrency must be within 1..={}, got {max_concurrency}",
            u32::MAX
        )));
    }
    Ok(())
}

impl Default for ConsumerConfig {
    /// - `max_concurrency = 100`
    /// - `poll_backoff = 100ms`
    /// - `drain_poll_interval = 500ms`
    /// - `settle_timeout = 10s`
    /// - `lock_leeway = 5s`
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            poll_backoff: Duration::from_millis(100),
            drain_poll_interval: Duration::from_millis(500),
            settle_timeout: Duration::from_secs(10),
            lock_leeway: Duration::from_secs(5),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
