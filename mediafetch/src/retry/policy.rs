//! Backoff computation and error classification.
//!
//! # Delay formula
//!
//! ```text
//! nominal(i) = min(base * 2^i, cap)
//! delay(i)   = min(nominal(i) * (1 + u), cap)     u ~ Uniform[-jitter, +jitter]
//! ```
//!
//! With the default 25% jitter a saturated delay always lies in
//! `[0.75 * cap, cap]`.
//!
//! # Classification
//!
//! | Error                                         | Class     |
//! |-----------------------------------------------|-----------|
//! | connect/reset, timeout, 5xx, 408/425/429      | Retryable |
//! | truncated body, extractor crash               | Retryable |
//! | 401/403, 404/410, malformed URL, bad content  | Terminal  |
//! | disk full, admission rejection                | Terminal  |

use std::io;
use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorClass, FetchError};

/// Default base delay for exponential backoff (1 second).
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Default cap for metadata/API calls (30 seconds).
pub const DEFAULT_METADATA_CAP_SECS: u64 = 30;

/// Default cap for byte-stream downloads (60 seconds).
pub const DEFAULT_STREAM_CAP_SECS: u64 = 60;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default jitter fraction (±25%).
pub const DEFAULT_JITTER: f64 = 0.25;

/// Kind of call being retried; selects the delay cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Page fetches, API and GraphQL calls.
    Metadata,
    /// Media byte streams.
    Stream,
}

/// Exponential backoff with jitter plus the shared error classification table.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    metadata_cap: Duration,
    stream_cap: Duration,
    max_retries: u32,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            metadata_cap: Duration::from_secs(DEFAULT_METADATA_CAP_SECS),
            stream_cap: Duration::from_secs(DEFAULT_STREAM_CAP_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Set the base delay.
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    /// Set the cap used for [`CallClass::Metadata`].
    pub fn with_metadata_cap(mut self, cap: Duration) -> Self {
        self.metadata_cap = cap;
        self
    }

    /// Set the cap used for [`CallClass::Stream`].
    pub fn with_stream_cap(mut self, cap: Duration) -> Self {
        self.stream_cap = cap;
        self
    }

    /// Set how many times a failed operation is retried.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay cap for a call class.
    pub fn cap(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Metadata => self.metadata_cap,
            CallClass::Stream => self.stream_cap,
        }
    }

    /// Backoff before retry number `attempt_index` (0 = first retry), without jitter.
    pub fn nominal_delay(&self, attempt_index: u32, class: CallClass) -> Duration {
        let cap = self.cap(class).as_secs_f64();
        let exp = 2f64.powi(attempt_index.min(1023) as i32);
        let secs = (self.base_delay.as_secs_f64() * exp).min(cap);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Backoff before retry number `attempt_index`, with jitter applied and
    /// the result clamped to the class cap.
    pub fn next_delay(&self, attempt_index: u32, class: CallClass) -> Duration {
        let nominal = self.nominal_delay(attempt_index, class).as_secs_f64();
        let factor = if self.jitter > 0.0 {
            1.0 + rand::rng().random_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        let secs = (nominal * factor).clamp(0.0, self.cap(class).as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Classifies an error as retryable or terminal.
    ///
    /// This is the only classification table in the crate.
    pub fn classify(err: &FetchError) -> ErrorClass {
        match err {
            FetchError::NetworkTransient(_)
            | FetchError::Timeout(_)
            | FetchError::Truncated { .. }
            | FetchError::Extractor { .. } => ErrorClass::Retryable,
            FetchError::AuthOrAccessDenied(_)
            | FetchError::NotFound(_)
            | FetchError::UnsupportedContent(_)
            | FetchError::InvalidUrl(_)
            | FetchError::ResourceExhausted(_)
            | FetchError::Busy(_)
            | FetchError::AllStrategiesFailed(_)
            | FetchError::Aborted { .. } => ErrorClass::Terminal,
            FetchError::Io(e) => classify_io(e),
        }
    }
}

fn classify_io(e: &io::Error) -> ErrorClass {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::UnexpectedEof => ErrorClass::Retryable,
        _ => ErrorClass::Terminal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::default().with_jitter(0.0)
    }

    #[test]
    fn test_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(), Duration::from_secs(1));
        assert_eq!(policy.cap(CallClass::Metadata), Duration::from_secs(30));
        assert_eq!(policy.cap(CallClass::Stream), Duration::from_secs(60));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_nominal_delay_doubles() {
        let policy = no_jitter();
        assert_eq!(policy.next_delay(0, CallClass::Stream), Duration::from_secs(1));
        assert_eq!(policy.next_delay(1, CallClass::Stream), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2, CallClass::Stream), Duration::from_secs(4));
        assert_eq!(policy.next_delay(5, CallClass::Stream), Duration::from_secs(32));
    }

    #[test]
    fn test_caps_differ_per_call_class() {
        let policy = no_jitter();
        assert_eq!(policy.next_delay(10, CallClass::Metadata), Duration::from_secs(30));
        assert_eq!(policy.next_delay(10, CallClass::Stream), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_attempt_index_does_not_overflow() {
        let policy = no_jitter();
        assert_eq!(
            policy.next_delay(u32::MAX, CallClass::Metadata),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.next_delay(2, CallClass::Stream).as_secs_f64();
            assert!((3.0..=5.0).contains(&d), "delay {} outside ±25% of 4s", d);
        }
    }

    #[test]
    fn test_classification_table() {
        use FetchError::*;

        let retryable = [
            NetworkTransient("reset".into()),
            Timeout(Duration::from_secs(60)),
            Truncated { expected: 10, actual: 5 },
            Extractor { code: Some(1), detail: "boom".into() },
            Io(io::Error::from(io::ErrorKind::ConnectionReset)),
        ];
        for err in &retryable {
            assert_eq!(RetryPolicy::classify(err), ErrorClass::Retryable, "{:?}", err);
        }

        let terminal = [
            NotFound("404".into()),
            AuthOrAccessDenied("401".into()),
            InvalidUrl("::".into()),
            UnsupportedContent("text/html".into()),
            ResourceExhausted("disk".into()),
            Busy("u1".into()),
            Io(io::Error::from(io::ErrorKind::PermissionDenied)),
        ];
        for err in &terminal {
            assert_eq!(RetryPolicy::classify(err), ErrorClass::Terminal, "{:?}", err);
        }
    }

    #[test]
    fn test_status_codes_flow_through_classification() {
        for status in [500u16, 502, 503, 429, 408] {
            assert_eq!(
                FetchError::from_status(status, "x").class(),
                ErrorClass::Retryable
            );
        }
        for status in [400u16, 401, 403, 404, 410, 415] {
            assert_eq!(
                FetchError::from_status(status, "x").class(),
                ErrorClass::Terminal
            );
        }
    }

    proptest! {
        #[test]
        fn prop_delay_bounded_by_cap(i in 0u32..200, stream in any::<bool>()) {
            let class = if stream { CallClass::Stream } else { CallClass::Metadata };
            let policy = RetryPolicy::default();
            let cap = policy.cap(class);
            let d = policy.next_delay(i, class);
            prop_assert!(d <= cap);
            prop_assert!(d >= Duration::ZERO);
        }

        #[test]
        fn prop_saturated_delay_at_least_three_quarters_cap(i in 6u32..500, stream in any::<bool>()) {
            // 2^6 * 1s already exceeds both caps
            let class = if stream { CallClass::Stream } else { CallClass::Metadata };
            let policy = RetryPolicy::default();
            let cap = policy.cap(class).as_secs_f64();
            let d = policy.next_delay(i, class).as_secs_f64();
            prop_assert!(d >= cap * 0.75 - 1e-9);
            prop_assert!(d <= cap + 1e-9);
        }

        #[test]
        fn prop_nominal_delay_monotonic(i in 0u32..64) {
            let policy = RetryPolicy::default();
            prop_assert!(
                policy.nominal_delay(i, CallClass::Stream)
                    <= policy.nominal_delay(i + 1, CallClass::Stream)
            );
        }
    }
}
