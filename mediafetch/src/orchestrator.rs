//! End-to-end execution of a download request.
//!
//! # Flow
//!
//! ```text
//! DownloadRequest
//!   │
//!   ├─ AdmissionController::try_acquire ──✗──▶ Busy / ResourceExhausted
//!   │
//!   ├─ StrategyRegistry::chain(platform)
//!   │
//!   ├─ for strategy in chain:               (strictly sequential)
//!   │     retry_observed(Stream):
//!   │       fresh temp path
//!   │       timeout(strategy.fetch)  ──✗──▶ discard temp, record attempt
//!   │       promote temp → final
//!   │     success ─▶ register final, return DownloadResult
//!   │     disk full ─▶ abort request
//!   │
//!   └─ AllStrategiesFailed { attempts }
//! ```
//!
//! The admission ticket is held by a guard and released on every exit
//! path, including cancellation of the `fetch` future. Every attempt and
//! every finished request is recorded in the orchestrator's
//! [`EngineMetrics`].

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use crate::admission::{AdmissionController, AdmissionTicket, Rejection};
use crate::error::{AggregateFailure, ErrorClass, FetchError, LifecycleError};
use crate::lifecycle::{FileId, FileLifecycleManager};
use crate::model::{
    AttemptOutcome, DownloadRequest, DownloadResult, EventSink, FetchEvent, ProgressReporter,
    SourceAttempt,
};
use crate::platform::Platform;
use crate::registry::StrategyRegistry;
use crate::retry::{retry_observed, AttemptReport, CallClass, RetryPolicy};
use crate::strategy::SourceStrategy;
use crate::telemetry::EngineMetrics;

/// Default per-attempt timeout (60 seconds).
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 60;

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Budget for a single strategy attempt.
    pub attempt_timeout: Duration,
    /// Per-platform overrides of `attempt_timeout`.
    pub platform_timeouts: HashMap<Platform, Duration>,
    /// Backoff and retry budget applied to each strategy.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            platform_timeouts: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_platform_timeout(mut self, platform: Platform, timeout: Duration) -> Self {
        self.platform_timeouts.insert(platform, timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Effective attempt timeout for `platform`.
    pub fn timeout_for(&self, platform: Platform) -> Duration {
        self.platform_timeouts
            .get(&platform)
            .copied()
            .unwrap_or(self.attempt_timeout)
    }
}

/// Releases the admission ticket when dropped.
struct TicketGuard<'a> {
    admission: &'a AdmissionController,
    ticket: AdmissionTicket,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.admission.release(&mut self.ticket);
    }
}

/// How one strategy's run ended.
enum StrategyOutcome {
    Done { path: PathBuf, size: u64 },
    Failed(FetchError),
}

/// Entry point of the engine: turns a [`DownloadRequest`] into a staged file.
pub struct DownloadOrchestrator {
    registry: Arc<StrategyRegistry>,
    admission: Arc<AdmissionController>,
    files: Arc<FileLifecycleManager>,
    config: OrchestratorConfig,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DownloadOrchestrator {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        admission: Arc<AdmissionController>,
        files: Arc<FileLifecycleManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            admission,
            files,
            config,
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    /// Records into a caller-owned collector instead of a private one.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn files(&self) -> &Arc<FileLifecycleManager> {
        &self.files
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Executes `request` without an event observer.
    pub async fn fetch(&self, request: DownloadRequest) -> Result<DownloadResult, FetchError> {
        self.fetch_with_events(request, EventSink::disabled()).await
    }

    /// Executes `request`, reporting milestones to `events`.
    ///
    /// On success the caller owns the returned file and must eventually hand
    /// its id back to [`release`](Self::release). On failure nothing the
    /// request wrote is left in the staging directory.
    pub async fn fetch_with_events(
        &self,
        request: DownloadRequest,
        events: EventSink,
    ) -> Result<DownloadResult, FetchError> {
        let platform = request.platform();
        let span = tracing::info_span!(
            "fetch",
            request_id = %request.id,
            platform = %platform,
            requester = %request.requester_id,
        );

        async {
            let result = self.run(&request, platform, &events).await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Request failed");
                events.emit(FetchEvent::Failed {
                    request_id: request.id,
                    error: e.to_string(),
                });
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Hands a delivered file back for deletion. Idempotent.
    pub async fn release(&self, file_id: FileId) -> bool {
        self.files.release(file_id).await
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        platform: Platform,
        events: &EventSink,
    ) -> Result<DownloadResult, FetchError> {
        let ticket = match self.admission.try_acquire(&request.requester_id) {
            Ok(ticket) => ticket,
            Err(rejection) => {
                self.metrics.request_rejected();
                return Err(rejection_error(rejection));
            }
        };
        let _guard = TicketGuard {
            admission: &self.admission,
            ticket,
        };
        let started = Instant::now();
        self.metrics.request_started();

        let result = self.walk_chain(request, platform, events).await;
        match &result {
            Ok(done) => self.metrics.request_succeeded(platform, done.size_bytes, started.elapsed()),
            Err(_) => self.metrics.request_failed(platform),
        }
        result
    }

    /// Runs the chain for an admitted request.
    async fn walk_chain(
        &self,
        request: &DownloadRequest,
        platform: Platform,
        events: &EventSink,
    ) -> Result<DownloadResult, FetchError> {
        self.files.ensure_staging_dir().await.map_err(staging_error)?;

        let chain = self.registry.chain(platform);
        let names: Vec<String> = chain.iter().map(|s| s.name().to_string()).collect();
        tracing::info!(url = %request.source_url, chain = ?names, "Starting fetch");
        events.emit(FetchEvent::Started {
            request_id: request.id,
            platform,
            chain: names,
        });

        let mut attempts: Vec<SourceAttempt> = Vec::new();

        for strategy in chain {
            match self
                .run_strategy(request, platform, strategy.as_ref(), events, &mut attempts)
                .await
            {
                StrategyOutcome::Done { path, size } => {
                    let file_id = self.files.register(&path);
                    tracing::info!(
                        strategy = strategy.name(),
                        path = %path.display(),
                        size_bytes = size,
                        "Fetch succeeded"
                    );
                    events.emit(FetchEvent::Succeeded {
                        request_id: request.id,
                        strategy: strategy.name().to_string(),
                        size_bytes: size,
                    });
                    return Ok(DownloadResult {
                        request_id: request.id,
                        file_id,
                        final_path: path,
                        size_bytes: size,
                        platform,
                        attempts,
                    });
                }
                StrategyOutcome::Failed(e) if e.is_request_fatal() => {
                    tracing::error!(
                        strategy = strategy.name(),
                        error = %e,
                        attempts = attempts.len(),
                        "Aborting request"
                    );
                    return Err(FetchError::Aborted {
                        source: Box::new(e),
                        failure: AggregateFailure {
                            request_id: request.id,
                            attempts,
                        },
                    });
                }
                StrategyOutcome::Failed(e) => {
                    tracing::info!(strategy = strategy.name(), error = %e, "Strategy exhausted, falling back");
                }
            }
        }

        Err(FetchError::AllStrategiesFailed(AggregateFailure {
            request_id: request.id,
            attempts,
        }))
    }

    /// Runs one strategy under the retry policy, appending every attempt to
    /// `attempts`.
    async fn run_strategy(
        &self,
        request: &DownloadRequest,
        platform: Platform,
        strategy: &dyn SourceStrategy,
        events: &EventSink,
        attempts: &mut Vec<SourceAttempt>,
    ) -> StrategyOutcome {
        let files = self.files.as_ref();
        let url = request.source_url.as_str();
        let request_id = request.id;
        let timeout = self.config.timeout_for(platform);
        let final_path = files.final_path_for(platform, &request.id);
        let final_path = &final_path;

        let op = move |attempt: u32| {
            let temp = files.allocate_temp_path(platform);
            events.emit(FetchEvent::AttemptStarted {
                request_id,
                strategy: strategy.name().to_string(),
                attempt,
            });
            tracing::debug!(strategy = strategy.name(), attempt, temp = %temp.display(), "Attempt started");

            async move {
                let progress = ProgressReporter::new(events.clone(), request_id, strategy.name());
                let fetched = match tokio::time::timeout(timeout, strategy.fetch(url, &temp, &progress)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(timeout)),
                };

                let promoted = match fetched {
                    Ok(_) => files.promote(&temp, final_path).await.map_err(promotion_error),
                    Err(e) => Err(e),
                };
                if promoted.is_err() {
                    files.discard(&temp).await;
                }
                promoted
            }
        };

        let observe = |report: &AttemptReport<'_>| {
            let outcome = match report.class() {
                None => AttemptOutcome::Success,
                Some(ErrorClass::Retryable) => AttemptOutcome::RetryableFailure,
                Some(ErrorClass::Terminal) => AttemptOutcome::TerminalFailure,
            };
            let error_detail = report.error.map(|e| e.to_string());
            self.metrics.record_attempt(
                strategy.name(),
                outcome,
                report
                    .finished_at
                    .duration_since(report.started_at)
                    .unwrap_or_default(),
                error_detail.as_deref(),
            );
            attempts.push(SourceAttempt {
                strategy: strategy.name().to_string(),
                started_at: report.started_at,
                finished_at: report.finished_at,
                outcome,
                error_detail,
            });

            if let Some(error) = report.error {
                tracing::warn!(
                    strategy = strategy.name(),
                    attempt = report.attempt,
                    retryable = outcome == AttemptOutcome::RetryableFailure,
                    error = %error,
                    "Attempt failed"
                );
                events.emit(FetchEvent::AttemptFailed {
                    request_id,
                    strategy: strategy.name().to_string(),
                    attempt: report.attempt,
                    retryable: outcome == AttemptOutcome::RetryableFailure,
                    error: error.to_string(),
                });
            }
            if let Some(delay) = report.next_delay {
                events.emit(FetchEvent::Backoff {
                    request_id,
                    strategy: strategy.name().to_string(),
                    delay_ms: delay.as_millis() as u64,
                });
            }
        };

        match retry_observed(&self.config.retry, CallClass::Stream, op, observe).await {
            Ok(size) => StrategyOutcome::Done {
                path: final_path.clone(),
                size,
            },
            Err(e) => StrategyOutcome::Failed(e),
        }
    }
}

fn rejection_error(rejection: Rejection) -> FetchError {
    match rejection {
        Rejection::RequesterBusy { .. } => FetchError::Busy(rejection.to_string()),
        Rejection::AtCapacity { .. } => FetchError::ResourceExhausted(rejection.to_string()),
    }
}

fn staging_error(e: LifecycleError) -> FetchError {
    match e {
        LifecycleError::StagingDir { source, .. } => FetchError::Io(source),
        other => FetchError::Io(io::Error::other(other.to_string())),
    }
}

fn promotion_error(e: LifecycleError) -> FetchError {
    match e {
        LifecycleError::EmptyFile(_) => {
            FetchError::NetworkTransient("strategy produced an empty file".to_string())
        }
        other => FetchError::Io(io::Error::other(other.to_string())),
    }
}
