//! Exponential backoff shared by queue deadlines and in-place storage retries.
//!
//! A failed transmission is not retried in place: the queue entry gets a
//! `next_attempt_at` deadline from [`RetryConfig::next_attempt_at`] and the
//! next pass picks it up. Transient local storage errors are retried in place
//! through [`RetryExecutor`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use parcelsync_common::config::millis;
use parcelsync_common::{Error, Result};

/// Backoff curve: `initial_delay * multiplier^n`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// In-place retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Spread each delay over +/-25% so clients do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// # Errors
    /// - `Error::Config` for a multiplier below 1 or an initial delay above the cap
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry multiplier must be at least 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::Config(
                "retry initial_delay exceeds max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (zero-based), without jitter.
    fn curve(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let delay = self.curve(retry);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }

    /// Epoch millis before which a document that failed `attempts` times
    /// must not be sent again.
    pub fn next_attempt_at(&self, attempts: u32, now_millis: i64) -> i64 {
        let delay = self.delay_for_attempt(attempts.saturating_sub(1));
        now_millis.saturating_add(delay.as_millis().min(i64::MAX as u128) as i64)
    }
}

/// Runs an async operation, retrying transient failures in place.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent.
    ///
    /// # Errors
    /// The first non-transient error (see [`Error::is_transient`]), or the
    /// last transient one once `max_retries` retries have failed.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(retries = retry, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && retry < self.config.max_retries => err,
                Err(err) => {
                    if retry > 0 {
                        warn!(retries = retry, error = %err, "giving up");
                    }
                    return Err(err);
                }
            };

            let delay = self.config.delay_for_attempt(retry);
            retry += 1;
            warn!(retry, ?delay, error = %err, "transient failure, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn flat(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[test]
    fn test_curve_doubles_and_caps() {
        let config = RetryConfig::new(10)
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        let delays: Vec<u64> = (0..5).map(|n| config.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1000));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0).as_millis();
            assert!((750..=1250).contains(&delay), "delay {}", delay);
        }
    }

    #[test]
    fn test_next_attempt_deadline() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(500))
            .with_jitter(false);

        assert_eq!(config.next_attempt_at(1, 1_000), 1_500);
        assert_eq!(config.next_attempt_at(3, 1_000), 3_000);
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::default().with_multiplier(0.5).validate().is_err());
        assert!(RetryConfig::default()
            .with_initial_delay(Duration::from_secs(120))
            .validate()
            .is_err());
    }

    #[test]
    fn test_serde_uses_millis() {
        let json = serde_json::to_value(RetryConfig::new(4)).unwrap();
        assert_eq!(json["initial_delay"], 1000);

        let parsed: RetryConfig = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(parsed.max_retries, 7);
        assert_eq!(parsed.max_delay, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_transient_error_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(flat(3));

        let counter = Arc::clone(&calls);
        let result = executor
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Storage("database is locked".to_string()))
                    } else {
                        Ok("committed")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "committed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(flat(3));

        let counter = Arc::clone(&calls);
        let result: Result<()> = executor
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Validation("bad delta".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(flat(2));

        let counter = Arc::clone(&calls);
        let result: Result<()> = executor
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network("unreachable".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
