//! Retry with backoff
//!
//! One policy type drives every retry loop in the crate: the client's connect
//! (1s, 2s, 4s ...), its publish (fixed short pause), and the producer's
//! connection recovery (1s .. 16s, waiting before each attempt). Broker operations
//! give up at once on errors that another attempt cannot fix.

use futures::future::BoxFuture;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::BrokerError;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for BrokerError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay after the first failure
    pub base_delay: Duration,

    /// Growth factor between consecutive delays (1.0 = fixed interval)
    pub multiplier: f64,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Sleep `base_delay` before the first attempt as well
    pub wait_before_first: bool,
}

impl RetryPolicy {
    /// Exponential backoff doubling from `base_delay`.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            wait_before_first: false,
        }
    }

    /// Same pause between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            wait_before_first: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_wait_before_first(mut self, wait: bool) -> Self {
        self.wait_before_first = wait;
        self
    }

    /// Delay to apply after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// The sequence of sleeps a full run of this policy performs.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let count = if self.wait_before_first {
            self.max_attempts
        } else {
            self.max_attempts.saturating_sub(1)
        };
        (1..=count).map(|attempt| self.delay_for(attempt))
    }
}

/// Retry an async operation according to `policy`.
///
/// The closure receives the 1-based attempt number. Every error is retried; the last
/// one is returned once every attempt has failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if attempt == 1 && policy.wait_before_first {
            tokio::time::sleep(policy.delay_for(1)).await;
        }

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retrying");
                }
                return Ok(result);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(attempts = max_attempts, error = %e, "Operation failed, giving up");
                return Err(e);
            }
            Err(e) => {
                let delay = if policy.wait_before_first {
                    policy.delay_for(attempt + 1)
                } else {
                    policy.delay_for(attempt)
                };
                debug!(
                    attempt,
                    max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Like [`retry_with_backoff`], for operations that need `&mut` access to some state
/// (a transport, a client) on every attempt.
///
/// Stops at the first error that is not [`Retryable::is_retryable`].
pub async fn retry_with_state<S, F, T, E>(
    state: &mut S,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S, u32) -> BoxFuture<'a, Result<T, E>>,
    E: Display + Retryable,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if attempt == 1 && policy.wait_before_first {
            tokio::time::sleep(policy.delay_for(1)).await;
        }

        match operation(&mut *state, attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => {
                warn!(attempt, error = %e, "Operation failed permanently, not retrying");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(attempts = max_attempts, error = %e, "Operation failed, giving up");
                return Err(e);
            }
            Err(e) => {
                let delay = if policy.wait_before_first {
                    policy.delay_for(attempt + 1)
                } else {
                    policy.delay_for(attempt)
                };
                debug!(attempt, max_attempts, error = %e, "Operation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential(4, Duration::from_secs(1));
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn test_recovery_shaped_delays() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1)).with_wait_before_first(true);
        let delays: Vec<u64> = policy.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(8), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert!(policy.delays().all(|d| d == Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&RetryPolicy::fixed(3, Duration::ZERO), |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_until_success() {
        let started = Instant::now();
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));

        let result = retry_with_backoff(&policy, |attempt| async move {
            if attempt < 3 { Err(format!("attempt {attempt}")) } else { Ok(attempt) }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        // 1s + 2s
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let result: Result<(), String> =
            retry_with_backoff(&RetryPolicy::exponential(2, Duration::from_secs(1)), |attempt| async move {
                Err(format!("failure {attempt}"))
            })
            .await;

        assert_eq!(result.unwrap_err(), "failure 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_state_mutates_state() {
        let mut calls: Vec<u32> = Vec::new();
        let policy = RetryPolicy::fixed(4, Duration::from_millis(10));

        let result = retry_with_state(&mut calls, &policy, |calls, attempt| {
            async move {
                calls.push(attempt);
                if calls.len() < 2 {
                    Err(BrokerError::Connection("not yet".into()))
                } else {
                    Ok(calls.len())
                }
            }
            .boxed()
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let started = Instant::now();
        let mut calls: Vec<u32> = Vec::new();
        let policy = RetryPolicy::fixed(5, Duration::from_secs(1));

        let result: Result<(), BrokerError> = retry_with_state(&mut calls, &policy, |calls, attempt| {
            async move {
                calls.push(attempt);
                Err(BrokerError::Serialization("invalid payload".into()))
            }
            .boxed()
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Serialization(_))));
        assert_eq!(calls, vec![1]);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_uses_every_attempt() {
        let mut calls: Vec<u32> = Vec::new();
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));

        let result: Result<(), BrokerError> = retry_with_state(&mut calls, &policy, |calls, attempt| {
            async move {
                calls.push(attempt);
                Err(BrokerError::Channel("closed".into()))
            }
            .boxed()
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Channel(_))));
        assert_eq!(calls, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_before_first_sleeps_up_front() {
        let started = Instant::now();
        let policy = RetryPolicy::exponential(2, Duration::from_secs(1)).with_wait_before_first(true);

        let _ = retry_with_backoff(&policy, |_| async { Ok::<_, String>(()) }).await;

        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }
}
