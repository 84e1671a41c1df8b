//! Retry-with-backoff helper shared by the LLM client adaptor and store
//! calls, per spec §7's transient-error recovery row.
//!
//! Grounded on the teacher's `engine::resilience::RetryExecutor`: the same
//! exponential-backoff-with-jitter loop, trimmed to just the retry piece
//! (the teacher's circuit breaker and bulkhead have no counterpart in
//! SPEC_FULL.md's scope and are dropped, see `DESIGN.md`).

use std::time::Duration;
use tracing::{instrument, warn};

/// Retry configuration. Defaults match spec §7's "3 attempts" for transient
/// store errors; the LLM taxonomy row ("retry once") uses `max_attempts: 2`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Per §7's "LLM timeout / 5xx: retry once" row.
    pub fn llm_once() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Runs `operation` with exponential backoff and jitter, up to
/// `config.max_attempts` total attempts. Returns the last error if every
/// attempt fails.
#[instrument(skip(config, operation))]
pub async fn retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if attempt >= config.max_attempts {
                    return Err(error);
                }
                warn!(attempt, %error, ?delay, "retrying after failure");

                let actual_delay = if config.jitter {
                    let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
                    delay + Duration::from_millis(jitter_ms)
                } else {
                    delay
                };
                tokio::time::sleep(actual_delay).await;

                delay = Duration::from_millis(
                    (delay.as_millis() as f64 * config.backoff_multiplier) as u64,
                )
                .min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let result: Result<u32, String> = retry(&config, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("transient".to_string())
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig::llm_once();
        let result: Result<u32, String> = retry(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("permanent".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
