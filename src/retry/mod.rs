//! Backoff executor: bounded retries with exponential delay and jitter.
//!
//! [`run_with_retry`] drives a single upstream operation. Each failure is offered to
//! a retry predicate; non-retryable errors and exhausted budgets return the error
//! unchanged. Between attempts the executor sleeps for
//! `min(base_delay * backoff_factor^attempt, max_delay)` plus up to 10% jitter.
//!
//! Mutations are only retried when the caller asserts idempotency, see
//! [`RetryPolicy::for_idempotency`].

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::env_or;
use crate::error::{Error, Result};
use crate::http::Method;

/// Fraction of the computed delay added as random jitter, at most.
const MAX_JITTER_RATIO: f64 = 0.1;

/// Retry budget and delay curve for one class of operation.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use upguard::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// let delays: Vec<u128> = (0..7).map(|n| policy.delay_for(n).as_millis()).collect();
/// assert_eq!(delays, [1000, 2000, 4000, 8000, 16000, 30000, 30000]);
///
/// let jittered = policy.jittered_delay(1);
/// assert!(jittered >= Duration::from_millis(2000));
/// assert!(jittered <= Duration::from_millis(2200));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay, before jitter.
    pub max_delay: Duration,
    /// Multiplier applied per retry. Values below 1 from the environment are
    /// ignored.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Reads `UPGUARD_RETRY_MAX`, `UPGUARD_RETRY_BASE_MS`,
    /// `UPGUARD_RETRY_MAX_DELAY_MS` and `UPGUARD_RETRY_FACTOR`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backoff_factor = env_or("UPGUARD_RETRY_FACTOR", defaults.backoff_factor);
        Self {
            max_retries: env_or("UPGUARD_RETRY_MAX", defaults.max_retries),
            base_delay: Duration::from_millis(env_or(
                "UPGUARD_RETRY_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(env_or(
                "UPGUARD_RETRY_MAX_DELAY_MS",
                defaults.max_delay.as_millis() as u64,
            )),
            backoff_factor: if backoff_factor >= 1.0 {
                backoff_factor
            } else {
                defaults.backoff_factor
            },
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Returns this policy for idempotent operations, or a single-attempt policy
    /// otherwise.
    pub fn for_idempotency(&self, idempotency: Idempotency) -> Self {
        match idempotency {
            Idempotency::Idempotent => self.clone(),
            Idempotency::NonIdempotent => Self {
                max_retries: 0,
                ..self.clone()
            },
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = (base_ms * self.backoff_factor.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// [`delay_for`](Self::delay_for) plus a random extra of up to 10%.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        delay + delay.mul_f64(rand::random::<f64>() * MAX_JITTER_RATIO)
    }
}

/// Whether an operation may safely run more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Repeating the call has the same effect as making it once.
    Idempotent,
    /// The call runs at most once.
    NonIdempotent,
}

impl Idempotency {
    /// Classifies an HTTP method by RFC 9110 idempotency.
    pub fn of_method(method: &Method) -> Self {
        if method.is_idempotent() {
            Self::Idempotent
        } else {
            Self::NonIdempotent
        }
    }
}

/// Retries network failures, timeouts and 5xx responses; nothing else.
pub fn default_retry_predicate(err: &Error) -> bool {
    err.is_retryable()
}

/// Runs `operation` until it succeeds, the predicate rejects its error, or the
/// policy's retry budget is spent.
///
/// The operation is a factory: it is called once per attempt to produce a fresh
/// future. Timeouts belong inside the operation; this function never cancels an
/// attempt.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn run_with_retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt >= policy.max_retries || !should_retry(&err) {
                    return Err(err);
                }
                let delay = policy.jittered_delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying upstream operation"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// [`run_with_retry`] with [`default_retry_predicate`].
pub async fn retry_default<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_with_retry(policy, operation, default_retry_predicate).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> Error {
        UpstreamError::Http {
            status: 503,
            message: "unavailable".into(),
        }
        .into()
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let base = policy.delay_for(attempt);
            let jittered = policy.jittered_delay(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base + base.mul_f64(MAX_JITTER_RATIO));
        }
    }

    #[test]
    fn non_idempotent_mutations_get_one_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.for_idempotency(Idempotency::NonIdempotent).max_retries,
            0
        );
        assert_eq!(policy.for_idempotency(Idempotency::Idempotent), policy);
        assert_eq!(Idempotency::of_method(&Method::Post), Idempotency::NonIdempotent);
        assert_eq!(Idempotency::of_method(&Method::Put), Idempotency::Idempotent);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_default(&RetryPolicy::default(), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok("records")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "records");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_default(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(unavailable()) }
        })
        .await;
        assert!(matches!(result, Err(Error::TransientUpstream(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_default(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::Validation("unknown field".into()).into()) }
        })
        .await;
        assert!(matches!(result, Err(Error::PermanentUpstream(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        };
        let start = tokio::time::Instant::now();
        let _: Result<()> = retry_default(&policy, || async { Err(unavailable()) }).await;
        // 100ms + 200ms, each with up to 10% jitter.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed <= Duration::from_millis(330));
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_bounded(
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            factor in 1.5f64..4.0,
        ) {
            let policy = RetryPolicy {
                max_retries: 10,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                backoff_factor: factor,
            };
            let mut previous = Duration::ZERO;
            for attempt in 0..20 {
                let delay = policy.delay_for(attempt);
                prop_assert!(delay <= policy.max_delay);
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
