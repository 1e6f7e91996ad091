use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use drip_core::config::DispatchConfig;
use drip_core::{SequencerError, SequencerResult};
use rand::Rng;
use tracing::warn;

/// Exponential backoff between send attempts, capped and jittered.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    /// Up to this fraction of the delay is added at random so that a batch
    /// failing together does not retry together.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::seconds(config.backoff_base_secs.max(1)),
            max: Duration::seconds(config.backoff_max_secs.max(1)),
            jitter: 0.2,
        }
    }

    /// Backoff before the attempt following `attempts_made` failures,
    /// without jitter.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(20);
        let delay = self.base * 2i32.pow(exponent);
        delay.min(self.max)
    }

    /// When to try again after `attempts_made` failed attempts, or `None`
    /// when the attempt budget is spent.
    pub fn next_attempt(&self, attempts_made: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts_made >= self.max_attempts {
            return None;
        }
        let delay = self.backoff(attempts_made);
        let spread = (delay.num_milliseconds() as f64 * self.jitter) as i64;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        Some(now + (delay + Duration::milliseconds(jitter)).min(self.max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Bounded retry for store calls that hit lock contention. Only
/// [`SequencerError::StoreTimeout`] is retried; every other result is
/// returned as is.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    pub attempts: u32,
    pub initial: StdDuration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial: StdDuration::from_millis(50),
        }
    }
}

impl StoreRetry {
    /// Calls `op` until it stops timing out, the attempts run out or
    /// `keep_trying` says the result no longer matters. The pause doubles
    /// after each timeout.
    pub async fn run<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut() -> SequencerResult<T>,
        mut keep_trying: impl FnMut() -> bool,
    ) -> SequencerResult<T> {
        let mut delay = self.initial;
        let mut attempt = 1;
        loop {
            match op() {
                Err(SequencerError::StoreTimeout { timeout_ms }) if attempt < self.attempts && keep_trying() => {
                    warn!(operation, attempt, timeout_ms, "Store busy, retrying");
                    metrics::counter!("store.retries", "operation" => operation).increment(1);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
