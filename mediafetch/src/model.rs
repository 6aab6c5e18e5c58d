//! Request, attempt and result types shared by the orchestrator and its callers.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::lifecycle::FileId;
use crate::platform::Platform;

/// Progress events are throttled to one per this many bytes.
pub const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

/// Unique identifier of a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in file names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller's request to acquire one media artifact.
///
/// Immutable once built; the orchestrator owns it for the lifetime of the fetch.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: RequestId,
    pub source_url: String,
    /// Explicit platform; inferred from the URL host when absent.
    pub platform_hint: Option<Platform>,
    pub requested_at: SystemTime,
    pub requester_id: String,
}

impl DownloadRequest {
    pub fn new(source_url: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            source_url: source_url.into(),
            platform_hint: None,
            requested_at: SystemTime::now(),
            requester_id: requester_id.into(),
        }
    }

    pub fn with_platform_hint(mut self, platform: Platform) -> Self {
        self.platform_hint = Some(platform);
        self
    }

    /// Platform used for strategy lookup.
    pub fn platform(&self) -> Platform {
        self.platform_hint
            .unwrap_or_else(|| Platform::classify(&self.source_url))
    }
}

/// Result class of one strategy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// One entry of a request's attempt log. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct SourceAttempt {
    pub strategy: String,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
}

/// Successful outcome of a fetch.
///
/// The caller owns the file at `final_path` and must eventually hand
/// `file_id` back to [`FileLifecycleManager::release`](crate::lifecycle::FileLifecycleManager::release).
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub request_id: RequestId,
    pub file_id: FileId,
    pub final_path: PathBuf,
    pub size_bytes: u64,
    pub platform: Platform,
    pub attempts: Vec<SourceAttempt>,
}

impl DownloadResult {
    /// Name of the strategy that produced the file.
    pub fn winning_strategy(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.outcome == AttemptOutcome::Success)
            .map(|a| a.strategy.as_str())
    }
}

/// Observable milestones of a fetch, delivered over an event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Started {
        request_id: RequestId,
        platform: Platform,
        chain: Vec<String>,
    },
    AttemptStarted {
        request_id: RequestId,
        strategy: String,
        attempt: u32,
    },
    Progress {
        request_id: RequestId,
        strategy: String,
        downloaded: u64,
        total: Option<u64>,
    },
    AttemptFailed {
        request_id: RequestId,
        strategy: String,
        attempt: u32,
        retryable: bool,
        error: String,
    },
    Backoff {
        request_id: RequestId,
        strategy: String,
        delay_ms: u64,
    },
    Succeeded {
        request_id: RequestId,
        strategy: String,
        size_bytes: u64,
    },
    Failed {
        request_id: RequestId,
        error: String,
    },
}

/// Optional sender side of the event channel.
///
/// A closed or absent channel silently drops events; observers are never
/// allowed to fail a download.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<FetchEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<FetchEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: FetchEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Byte-level progress reporter handed to a strategy for one attempt.
#[derive(Debug)]
pub struct ProgressReporter {
    sink: EventSink,
    request_id: RequestId,
    strategy: String,
    last_reported: AtomicU64,
}

impl ProgressReporter {
    pub fn new(sink: EventSink, request_id: RequestId, strategy: impl Into<String>) -> Self {
        Self {
            sink,
            request_id,
            strategy: strategy.into(),
            last_reported: AtomicU64::new(0),
        }
    }

    /// Reporter that discards everything.
    pub fn silent() -> Self {
        Self::new(EventSink::disabled(), RequestId::new(), "")
    }

    /// Records progress, emitting at most one event per [`PROGRESS_STEP_BYTES`]
    /// plus one on completion.
    pub fn report(&self, downloaded: u64, total: Option<u64>) {
        let last = self.last_reported.load(Ordering::Relaxed);
        let complete = total.is_some_and(|t| downloaded >= t);
        if downloaded < last.saturating_add(PROGRESS_STEP_BYTES) && !complete {
            return;
        }
        if complete && last == downloaded {
            return;
        }
        self.last_reported.store(downloaded, Ordering::Relaxed);
        self.sink.emit(FetchEvent::Progress {
            request_id: self.request_id,
            strategy: self.strategy.clone(),
            downloaded,
            total,
        });
    }
}
