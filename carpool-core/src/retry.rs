//! Bounded retry with exponential backoff and jitter for transient ledger contention.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = try once)
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 0.0 = no jitter, 1.0 = delay anywhere in [0, 2x]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 25,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_initial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Run `operation`, retrying only errors that report `is_retryable()`.
    pub async fn run<F, Fut, T>(&self, operation: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.jittered_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying after contention");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(config.base_delay(1), Duration::from_millis(100));
        assert_eq!(config.base_delay(2), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(300));
        assert_eq!(config.base_delay(4), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_contention_is_retried_until_success() {
        let config = RetryConfig::default().with_initial_delay_ms(1);
        let calls = AtomicU32::new(0);

        let result = config
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::Contention("lock timeout".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_preconditions_are_not_retried() {
        let config = RetryConfig::default().with_initial_delay_ms(1);
        let calls = AtomicU32::new(0);
        let car_id = uuid::Uuid::new_v4();

        let result: CoreResult<()> = config
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::CarFull(car_id))
            })
            .await;

        assert_eq!(result, Err(CoreError::CarFull(car_id)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let config = RetryConfig::default().with_max_retries(2).with_initial_delay_ms(1);
        let calls = AtomicU32::new(0);

        let result: CoreResult<()> = config
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::Contention("serialization failure".to_string()))
            })
            .await;

        assert!(matches!(result, Err(CoreError::Contention(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
