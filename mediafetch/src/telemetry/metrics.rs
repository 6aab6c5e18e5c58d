//! Lock-light metrics collection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;

use super::snapshot::{PlatformSnapshot, RecordedError, StrategySnapshot, TelemetrySnapshot};
use crate::model::AttemptOutcome;
use crate::platform::Platform;

/// Number of recent error messages kept per strategy.
pub const RECENT_ERRORS_PER_STRATEGY: usize = 5;

#[derive(Debug, Default)]
struct StrategyTally {
    attempts: u64,
    successes: u64,
    retryable_failures: u64,
    terminal_failures: u64,
    total_time: Duration,
    max_time: Duration,
    recent_errors: VecDeque<RecordedError>,
}

#[derive(Debug, Default)]
struct PlatformTally {
    succeeded: u64,
    failed: u64,
    total_download_time: Duration,
    max_download_time: Duration,
}

/// Counters shared by every request an orchestrator runs.
#[derive(Debug)]
pub struct EngineMetrics {
    started: Instant,
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    requests_rejected: AtomicU64,
    bytes_delivered: AtomicU64,
    strategies: DashMap<String, StrategyTally>,
    platforms: DashMap<Platform, PlatformTally>,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests_started: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            strategies: DashMap::new(),
            platforms: DashMap::new(),
        }
    }

    /// A request passed admission and started walking its chain.
    pub fn request_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was turned away by admission control.
    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A request produced a staged file after `elapsed`.
    pub fn request_succeeded(&self, platform: Platform, bytes: u64, elapsed: Duration) {
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);

        let mut tally = self.platforms.entry(platform).or_default();
        tally.succeeded += 1;
        tally.total_download_time += elapsed;
        tally.max_download_time = tally.max_download_time.max(elapsed);
    }

    /// A request ended without a file.
    pub fn request_failed(&self, platform: Platform) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.platforms.entry(platform).or_default().failed += 1;
    }

    /// One strategy attempt finished.
    pub fn record_attempt(
        &self,
        strategy: &str,
        outcome: AttemptOutcome,
        elapsed: Duration,
        error: Option<&str>,
    ) {
        let mut tally = match self.strategies.get_mut(strategy) {
            Some(tally) => tally,
            None => self.strategies.entry(strategy.to_string()).or_default(),
        };

        tally.attempts += 1;
        tally.total_time += elapsed;
        tally.max_time = tally.max_time.max(elapsed);
        match outcome {
            AttemptOutcome::Success => tally.successes += 1,
            AttemptOutcome::RetryableFailure => tally.retryable_failures += 1,
            AttemptOutcome::TerminalFailure => tally.terminal_failures += 1,
        }

        if let Some(message) = error {
            if tally.recent_errors.len() == RECENT_ERRORS_PER_STRATEGY {
                tally.recent_errors.pop_front();
            }
            tally.recent_errors.push_back(RecordedError {
                at: SystemTime::now(),
                message: message.to_string(),
            });
        }
    }

    /// Point-in-time copy of every counter.
    ///
    /// Strategies are ordered by name and platforms by [`Platform::ALL`].
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut strategies: Vec<StrategySnapshot> = self
            .strategies
            .iter()
            .map(|entry| {
                let t = entry.value();
                StrategySnapshot {
                    name: entry.key().clone(),
                    attempts: t.attempts,
                    successes: t.successes,
                    retryable_failures: t.retryable_failures,
                    terminal_failures: t.terminal_failures,
                    total_attempt_time: t.total_time,
                    max_attempt_time: t.max_time,
                    recent_errors: t.recent_errors.iter().cloned().collect(),
                }
            })
            .collect();
        strategies.sort_by(|a, b| a.name.cmp(&b.name));

        let platforms = Platform::ALL
            .iter()
            .filter_map(|platform| {
                self.platforms.get(platform).map(|t| PlatformSnapshot {
                    platform: *platform,
                    succeeded: t.succeeded,
                    failed: t.failed,
                    total_download_time: t.total_download_time,
                    max_download_time: t.max_download_time,
                })
            })
            .collect();

        TelemetrySnapshot {
            uptime: self.started.elapsed(),
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            strategies,
            platforms,
        }
    }
}
