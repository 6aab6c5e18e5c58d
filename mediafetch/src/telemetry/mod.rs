//! Engine telemetry for operators and the CLI.
//!
//! The orchestrator feeds every attempt and every finished request into an
//! [`EngineMetrics`] collector. Request totals are plain atomic counters;
//! per-strategy and per-platform tallies live in sharded maps so concurrent
//! requests rarely contend.
//!
//! # Architecture
//!
//! ```text
//! DownloadOrchestrator ─────► EngineMetrics ─────► TelemetrySnapshot ─────► Views
//!  (attempts, results)        (atomic counters)    (point-in-time copy)     (CLI, logs)
//! ```
//!
//! # Example
//!
//! ```
//! use mediafetch::telemetry::{EngineMetrics, Health};
//! use mediafetch::{AttemptOutcome, Platform};
//! use std::time::Duration;
//!
//! let metrics = EngineMetrics::new();
//! metrics.request_started();
//! metrics.record_attempt("cobalt", AttemptOutcome::RetryableFailure, Duration::from_secs(2), Some("HTTP 429"));
//! metrics.record_attempt("ytdlp", AttemptOutcome::Success, Duration::from_secs(5), None);
//! metrics.request_succeeded(Platform::YouTube, 4096, Duration::from_secs(7));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.requests_succeeded, 1);
//! assert_eq!(snapshot.strategy("ytdlp").map(|s| s.health()), Some(Health::Healthy));
//! ```

mod metrics;
mod snapshot;

pub use metrics::{EngineMetrics, RECENT_ERRORS_PER_STRATEGY};
pub use snapshot::{Health, PlatformSnapshot, RecordedError, StrategySnapshot, TelemetrySnapshot};
