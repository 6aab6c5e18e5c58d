//! Error types for the acquisition engine.
//!
//! Every failure a strategy can produce is expressed as a [`FetchError`]
//! variant. Whether that failure is worth retrying is decided in exactly one
//! place, [`RetryPolicy::classify`](crate::retry::RetryPolicy::classify), so
//! the orchestrator never needs host-specific knowledge.
//!
//! Errors from configuration loading, file bookkeeping and the persistent
//! connection manager live in their own enums next to this one.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::{AttemptOutcome, RequestId, SourceAttempt};

/// Outcome class of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure; the same operation may succeed if repeated.
    Retryable,
    /// Repeating the same operation against the same source will not help.
    Terminal,
}

/// Errors produced by source strategies and the orchestrator.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection reset, refused, DNS failure, 5xx or 429 responses.
    #[error("network failure: {0}")]
    NetworkTransient(String),

    /// An operation exceeded its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// 401/403 or an expired/rejected token.
    #[error("access denied: {0}")]
    AuthOrAccessDenied(String),

    /// The remote reports the media does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The source answered with something that is not downloadable media.
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),

    /// The URL could not be parsed or is not understood by a strategy.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Fewer bytes arrived than the server announced.
    #[error("truncated download: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Announced payload size.
        expected: u64,
        /// Bytes actually written.
        actual: u64,
    },

    /// Disk full or concurrency budget saturated. Fatal for the whole request.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Admission rejected because the requester already has a live request.
    #[error("busy: {0}")]
    Busy(String),

    /// The external extraction tool failed without a recognisable cause.
    #[error("extractor failed (exit code {code:?}): {detail}")]
    Extractor {
        /// Process exit code, if the process exited normally.
        code: Option<i32>,
        /// Last meaningful stderr line.
        detail: String,
    },

    /// Local I/O failure while writing the staged file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Every strategy in the chain failed.
    #[error("{0}")]
    AllStrategiesFailed(AggregateFailure),

    /// A request-fatal error stopped the chain before it was exhausted.
    #[error("request {} aborted after {} attempts: {source}", .failure.request_id, .failure.attempts.len())]
    Aborted {
        /// The error that stopped the chain.
        #[source]
        source: Box<FetchError>,
        /// Attempts recorded up to and including the fatal one.
        failure: AggregateFailure,
    },
}

impl FetchError {
    /// Maps an HTTP status code onto the error taxonomy.
    ///
    /// 408, 425, 429 and 5xx are transient. 401/403 are access failures,
    /// 404/410 mean the media is gone, 415 is unsupported content and the
    /// remaining 4xx codes are treated as terminal access failures.
    pub fn from_status(status: u16, context: &str) -> Self {
        let detail = format!("HTTP {} from {}", status, context);
        match status {
            408 | 425 | 429 | 500..=599 => FetchError::NetworkTransient(detail),
            401 | 403 => FetchError::AuthOrAccessDenied(detail),
            404 | 410 => FetchError::NotFound(detail),
            415 => FetchError::UnsupportedContent(detail),
            _ => FetchError::AuthOrAccessDenied(detail),
        }
    }

    /// Retry class of this error, as decided by the shared classification table.
    pub fn class(&self) -> ErrorClass {
        crate::retry::RetryPolicy::classify(self)
    }

    /// Whether this error must abort the whole request instead of falling
    /// through to the next strategy.
    pub fn is_request_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::ResourceExhausted(_) | FetchError::Busy(_) | FetchError::Aborted { .. }
        )
    }

    /// Attempt log carried by an aggregate or aborted failure, if any.
    pub fn attempts(&self) -> Option<&[SourceAttempt]> {
        match self {
            FetchError::AllStrategiesFailed(agg) => Some(&agg.attempts),
            FetchError::Aborted { failure, .. } => Some(&failure.attempts),
            _ => None,
        }
    }

    /// The error that ended the request, looking through [`FetchError::Aborted`].
    pub fn root_cause(&self) -> &FetchError {
        match self {
            FetchError::Aborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return FetchError::NetworkTransient(format!("request timed out: {}", e));
        }
        if let Some(status) = e.status() {
            let context = e
                .url()
                .map(|u| u.as_str().to_string())
                .unwrap_or_else(|| "remote".to_string());
            return FetchError::from_status(status.as_u16(), &context);
        }
        if e.is_builder() {
            return FetchError::InvalidUrl(e.to_string());
        }
        if e.is_decode() {
            return FetchError::UnsupportedContent(e.to_string());
        }
        FetchError::NetworkTransient(e.to_string())
    }
}

/// Aggregate failure carrying the attempt log of every strategy that ran.
#[derive(Debug, Clone)]
pub struct AggregateFailure {
    /// Request that failed.
    pub request_id: RequestId,
    /// Every attempt in execution order.
    pub attempts: Vec<SourceAttempt>,
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all strategies failed for request {} ({} attempts)",
            self.request_id,
            self.attempts.len()
        )?;
        for attempt in &self.attempts {
            let outcome = match attempt.outcome {
                AttemptOutcome::Success => "ok",
                AttemptOutcome::RetryableFailure => "retryable",
                AttemptOutcome::TerminalFailure => "terminal",
            };
            write!(f, "; {} [{}]", attempt.strategy, outcome)?;
            if let Some(detail) = &attempt.error_detail {
                write!(f, ": {}", detail)?;
            }
        }
        Ok(())
    }
}

/// Errors raised while loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("invalid value '{value}' for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("invalid proxy entry '{entry}': {reason}")]
    InvalidProxy { entry: String, reason: String },
}

/// Errors raised by the file lifecycle manager.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown file id {0}")]
    UnknownFile(u64),

    #[error("failed to prepare staging directory {path}: {source}")]
    StagingDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("staged file {0} is empty")]
    EmptyFile(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while assembling or starting the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP transport: {0}")]
    Transport(#[source] FetchError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Errors surfaced by the persistent connection manager.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The operation kept failing until the attempt budget ran out.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The operation reported a non-retryable failure.
    #[error("fatal connection error: {0}")]
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            FetchError::from_status(503, "cdn"),
            FetchError::NetworkTransient(_)
        ));
        assert!(matches!(
            FetchError::from_status(429, "api"),
            FetchError::NetworkTransient(_)
        ));
        assert!(matches!(
            FetchError::from_status(404, "cdn"),
            FetchError::NotFound(_)
        ));
        assert!(matches!(
            FetchError::from_status(401, "api"),
            FetchError::AuthOrAccessDenied(_)
        ));
        assert!(matches!(
            FetchError::from_status(403, "api"),
            FetchError::AuthOrAccessDenied(_)
        ));
        assert!(matches!(
            FetchError::from_status(415, "cdn"),
            FetchError::UnsupportedContent(_)
        ));
    }

    #[test]
    fn test_request_fatal_errors() {
        assert!(FetchError::ResourceExhausted("disk full".into()).is_request_fatal());
        assert!(FetchError::Busy("u1".into()).is_request_fatal());
        assert!(!FetchError::NotFound("gone".into()).is_request_fatal());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).is_request_fatal());
    }

    #[test]
    fn test_aborted_exposes_attempts_and_cause() {
        let now = std::time::SystemTime::now();
        let err = FetchError::Aborted {
            source: Box::new(FetchError::ResourceExhausted("disk full".into())),
            failure: AggregateFailure {
                request_id: RequestId::new(),
                attempts: vec![SourceAttempt {
                    strategy: "ytdlp".into(),
                    started_at: now,
                    finished_at: now,
                    outcome: AttemptOutcome::TerminalFailure,
                    error_detail: Some("resource exhausted: disk full".into()),
                }],
            },
        };

        assert!(err.is_request_fatal());
        assert_eq!(err.attempts().unwrap()[0].strategy, "ytdlp");
        assert!(matches!(err.root_cause(), FetchError::ResourceExhausted(_)));
        assert!(err.to_string().contains("aborted after 1 attempts"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_aggregate_display_lists_attempts() {
        use std::time::SystemTime;

        let now = SystemTime::now();
        let agg = AggregateFailure {
            request_id: RequestId::new(),
            attempts: vec![
                SourceAttempt {
                    strategy: "cobalt".into(),
                    started_at: now,
                    finished_at: now,
                    outcome: AttemptOutcome::RetryableFailure,
                    error_detail: Some("timed out after 60s".into()),
                },
                SourceAttempt {
                    strategy: "ytdlp".into(),
                    started_at: now,
                    finished_at: now,
                    outcome: AttemptOutcome::TerminalFailure,
                    error_detail: Some("not found".into()),
                },
            ],
        };

        let text = agg.to_string();
        assert!(text.contains("2 attempts"));
        assert!(text.contains("cobalt [retryable]: timed out after 60s"));
        assert!(text.contains("ytdlp [terminal]: not found"));
    }
}
