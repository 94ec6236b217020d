//! Exponential backoff shared by the
//! [`ParallelExecutor`](crate::concurrency::ParallelExecutor) and the
//! [`UrlProcessor`](crate::crawler::UrlProcessor). Each owns its own
//! [`RetryConfig`]; the two budgets are independent.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy: `initial * multiplier^(n-1)` ms before retry `n`, capped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay
    pub max_delay_ms: u64,

    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Result of an operation run under a [`RetryConfig`]
#[derive(Debug)]
pub struct Attempted<T, E> {
    /// Final outcome (success, or the last error)
    pub result: Result<T, E>,
    /// Number of retries performed, always `<= max_retries`
    pub retries: u32,
}

impl<T, E> Attempted<T, E> {
    /// Total attempts including the first one
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

impl RetryConfig {
    /// Doubling backoff between `initial_delay_ms` and `max_delay_ms`
    pub fn with_delays(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `retry` (1-based); zero for `retry == 0`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay_ms = if retry == 0 {
            0
        } else {
            let grown = self.initial_delay_ms as f64 * self.multiplier.powi((retry - 1) as i32);
            if grown.is_finite() && grown < self.max_delay_ms as f64 {
                grown as u64
            } else {
                self.max_delay_ms
            }
        };

        Duration::from_millis(delay_ms)
    }

    /// Whether another attempt is allowed after `retries` retries already made
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Drive `operation` until it succeeds, fails for good, or the budget runs out
    ///
    /// `operation` receives the retry number (0 for the first attempt).
    /// `should_retry` decides whether an error is worth another attempt, and
    /// `on_retry` is called with the upcoming retry number, the delay about to
    /// be slept and the error that caused it.
    pub async fn run<T, E, F, Fut, P, R>(
        &self,
        mut operation: F,
        should_retry: P,
        mut on_retry: R,
    ) -> Attempted<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        R: FnMut(u32, Duration, &E),
        E: std::fmt::Display,
    {
        let mut retries = 0;

        loop {
            match operation(retries).await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(retries, "Recovered after retry");
                    }
                    return Attempted {
                        result: Ok(value),
                        retries,
                    };
                }
                Err(e) => {
                    if !should_retry(&e) || !self.allows_retry(retries) {
                        warn!(
                            retries,
                            max_retries = self.max_retries,
                            error = %e,
                            "Retry budget exhausted or error is final"
                        );
                        return Attempted {
                            result: Err(e),
                            retries,
                        };
                    }

                    retries += 1;
                    let delay = self.delay_for(retries);
                    debug!(
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Backing off before next attempt"
                    );
                    on_retry(retries, delay, &e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success_has_no_retries() {
        let outcome = policy(3)
            .run(|_| async { Ok::<_, String>("page") }, |_| true, |_, _, _| {})
            .await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.result.unwrap(), "page");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_third_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);

        let outcome = policy(3)
            .run(
                move |retry| {
                    let seen = Arc::clone(&seen);
                    async move {
                        assert_eq!(seen.fetch_add(1, Ordering::SeqCst), retry);
                        if retry < 2 {
                            Err(format!("flaky #{retry}"))
                        } else {
                            Ok(retry)
                        }
                    }
                },
                |_| true,
                |_, _, _| {},
            )
            .await;

        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_last_error_and_delays() {
        let mut delays = Vec::new();
        let outcome: Attempted<(), String> = policy(2)
            .run(
                |retry| async move { Err(format!("down on call {retry}")) },
                |_| true,
                |_, delay, _| delays.push(delay),
            )
            .await;

        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.result.unwrap_err(), "down on call 2");
        assert_eq!(
            delays,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test]
    async fn test_final_errors_short_circuit() {
        let outcome: Attempted<(), String> = policy(3)
            .run(
                |_| async { Err("410 gone".to_string()) },
                |e| !e.starts_with("410"),
                |_, _, _| panic!("must not retry"),
            )
            .await;

        assert_eq!(outcome.retries, 0);
    }

    #[test]
    fn test_delays_double_until_capped() {
        let defaults = RetryConfig::default();
        let delays: Vec<u64> = (0..=6).map(|n| defaults.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![0, 1000, 2000, 4000, 8000, 16_000, 30_000]);

        let tight = RetryConfig::with_delays(10, 1000, 5000);
        assert_eq!(tight.delay_for(10), Duration::from_millis(5000));
        assert_eq!(tight.delay_for(500), Duration::from_millis(5000));
    }
}
