//! Retry policy and the generic retry combinator.
//!
//! Strategies implement a single attempt; [`retry_with`] and [`retry_observed`]
//! repeat it according to a [`RetryPolicy`], stopping early on terminal
//! errors and sleeping between attempts.
//!
//! # Example
//!
//! ```ignore
//! use mediafetch::retry::{retry_with, CallClass, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let body = retry_with(&policy, CallClass::Metadata, |attempt| async move {
//!     fetch_page(attempt).await
//! })
//! .await?;
//! ```

mod policy;

pub use policy::{
    CallClass, RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER, DEFAULT_MAX_RETRIES,
    DEFAULT_METADATA_CAP_SECS, DEFAULT_STREAM_CAP_SECS,
};

use std::future::Future;
use std::time::{Duration, SystemTime};

use crate::error::{ErrorClass, FetchError};

/// What happened in one attempt of a retried operation.
#[derive(Debug)]
pub struct AttemptReport<'a> {
    /// Zero-based attempt number.
    pub attempt: u32,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    /// `None` when the attempt succeeded.
    pub error: Option<&'a FetchError>,
    /// Backoff before the next attempt, if one will follow.
    pub next_delay: Option<Duration>,
}

impl AttemptReport<'_> {
    pub fn class(&self) -> Option<ErrorClass> {
        self.error.map(RetryPolicy::classify)
    }
}

/// Runs `op` until it succeeds, fails terminally, or the policy's attempt
/// budget is spent.
pub async fn retry_with<T, F, Fut>(policy: &RetryPolicy, class: CallClass, op: F) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    retry_observed(policy, class, op, |_| {}).await
}

/// Like [`retry_with`], calling `observe` after every attempt.
///
/// The observer sees each attempt's timing, its error and the delay that
/// will precede the next attempt. The last error is returned unchanged.
pub async fn retry_observed<T, F, Fut, O>(
    policy: &RetryPolicy,
    class: CallClass,
    mut op: F,
    mut observe: O,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    O: FnMut(&AttemptReport<'_>),
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        let started_at = SystemTime::now();
        let result = op(attempt).await;
        let finished_at = SystemTime::now();

        let err = match result {
            Ok(value) => {
                observe(&AttemptReport {
                    attempt,
                    started_at,
                    finished_at,
                    error: None,
                    next_delay: None,
                });
                return Ok(value);
            }
            Err(err) => err,
        };

        let retryable = RetryPolicy::classify(&err) == ErrorClass::Retryable;
        let next_delay = (retryable && attempt + 1 < max_attempts)
            .then(|| policy.next_delay(attempt, class));

        observe(&AttemptReport {
            attempt,
            started_at,
            finished_at,
            error: Some(&err),
            next_delay,
        });

        match next_delay {
            Some(delay) => {
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_max_retries(retries)
    }

    #[tokio::test]
    async fn test_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with(&fast_policy(2), CallClass::Metadata, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, FetchError>(7) }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_with(&fast_policy(3), CallClass::Metadata, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(FetchError::NetworkTransient("reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with(&fast_policy(5), CallClass::Stream, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::NotFound("gone".into())) }
        })
        .await;

        assert!(matches!(result, Err(FetchError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with(&fast_policy(2), CallClass::Stream, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Timeout(Duration::from_secs(1))) }
        })
        .await;

        assert!(matches!(result, Err(FetchError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_observer_sees_every_attempt() {
        let mut seen = Vec::new();
        let _: Result<(), _> = retry_observed(
            &fast_policy(1),
            CallClass::Stream,
            |_| async { Err(FetchError::NetworkTransient("x".into())) },
            |report| seen.push((report.attempt, report.next_delay.is_some())),
        )
        .await;

        assert_eq!(seen, vec![(0, true), (1, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let policy = RetryPolicy::default().with_jitter(0.0).with_max_retries(2);
        let start = tokio::time::Instant::now();

        let _: Result<(), _> = retry_with(&policy, CallClass::Stream, |_| async {
            Err(FetchError::NetworkTransient("x".into()))
        })
        .await;

        // 1s + 2s of backoff on the paused clock
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
