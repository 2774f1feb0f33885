//! Exponential backoff for whole jobs.
//!
//! This wraps an entire unit of work (for example one import run). It is not
//! meant for per-request retries inside a batch loop.
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: Some(5),
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Some(Duration::from_secs(3600)),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: Some(1),
            ..Default::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Runs `job` until it succeeds or the attempts are exhausted, returning the
    /// last error in the latter case.
    pub async fn run<T, E, F, Fut>(&self, name: &str, job: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_while(name, job, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but stops at the first error for which
    /// `retryable` returns false.
    pub async fn run_while<T, E, F, Fut, R>(
        &self,
        name: &str,
        mut job: F,
        retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match job().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !retryable(&err) {
                        tracing::warn!(job = name, attempt, error = %err, "not retrying");
                        return Err(err);
                    }
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        tracing::error!(job = name, attempt, error = %err, "giving up");
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        job = name,
                        attempt,
                        error = %err,
                        "retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Some(Duration::from_millis(4)),
        }
    }

    #[test]
    fn test_delay_growth() {
        let policy = RetryPolicy {
            max_attempts: None,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Some(Duration::from_secs(10)),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        // Capped
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(60), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = fast_policy(None)
            .run("test", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n < 3 { Err(format!("fail {n}")) } else { Ok(n) } }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_gives_up() {
        let calls = Cell::new(0);
        let result: Result<(), String> = fast_policy(Some(2))
            .run("test", || {
                calls.set(calls.get() + 1);
                async { Err("boom".to_string()) }
            })
            .await;
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(calls.get(), 2);

        calls.set(0);
        let result: Result<(), String> = RetryPolicy::none()
            .run("test", || {
                calls.set(calls.get() + 1);
                async { Err("boom".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_retries() {
        let calls = Cell::new(0);
        let result: Result<(), String> = fast_policy(None)
            .run_while(
                "test",
                || {
                    calls.set(calls.get() + 1);
                    let n = calls.get();
                    async move { Err(if n < 2 { "transient" } else { "permanent" }.to_string()) }
                },
                |err| err == "transient",
            )
            .await;
        assert_eq!(result, Err("permanent".to_string()));
        assert_eq!(calls.get(), 2);
    }
}
