// src/queue/backoff.rs
//! Bounded retry with exponential backoff
//!
//! Broker operations (claims, reports) retry on failure with exponentially
//! growing, jittered delays. The attempt count is bounded; callers see a
//! stable `max attempts exceeded` error once the budget is spent.

use crate::utils::errors::{EngineError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct BackoffOptions {
    pub max_attempts: u32,
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl BackoffOptions {
    /// Delay before attempt `attempt + 1`, jittered, never past `max`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .min
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        exp.mul_f64(jitter).min(self.max)
    }
}

/// Run `op` until it succeeds or the attempt budget is spent
///
/// The operation receives the 1-based attempt number.
pub async fn try_with_backoff<T, F, Fut>(mut op: F, options: BackoffOptions) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= options.max_attempts => {
                warn!(attempt, error = %e, "retry budget spent");
                return Err(EngineError::MaxAttemptsExceeded);
            }
            Err(e) => {
                let delay = options.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn options() -> BackoffOptions {
        BackoffOptions {
            max_attempts: 4,
            min: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = try_with_backoff(
            move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
            options(),
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_max_attempts_then_stable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = try_with_backoff::<(), _, _>(
            move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Transport("broker down".to_string()))
                }
            },
            options(),
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, EngineError::MaxAttemptsExceeded));
        assert_eq!(err.to_string(), "max attempts exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_mid_sequence() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = try_with_backoff(
            move |attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(EngineError::Transport("flaky".to_string()))
                    } else {
                        Ok("ok")
                    }
                }
            },
            options(),
        )
        .await
        .unwrap();
        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delays_grow_and_stay_bounded() {
        let options = options();
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = options.delay_for(attempt);
            assert!(delay <= options.max, "attempt {} exceeded cap", attempt);
            // growth holds until the cap flattens the curve
            if previous < options.max.mul_f64(0.8) {
                assert!(delay >= previous.mul_f64(0.4));
            }
            previous = delay;
        }
    }
}
