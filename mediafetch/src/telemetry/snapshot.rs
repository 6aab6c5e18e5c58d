//! Point-in-time telemetry views.

use std::fmt;
use std::time::{Duration, SystemTime};

use crate::platform::Platform;

/// Health grade derived from a success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// At least 90% of attempts succeeded.
    Healthy,
    /// Between 70% and 90%.
    Degraded,
    /// Below 70%.
    Critical,
    /// Nothing recorded yet.
    Unknown,
}

impl Health {
    /// Grades a success rate given as a fraction in `0.0..=1.0`.
    pub fn from_success_rate(rate: Option<f64>) -> Self {
        match rate {
            None => Health::Unknown,
            Some(r) if r >= 0.9 => Health::Healthy,
            Some(r) if r >= 0.7 => Health::Degraded,
            Some(_) => Health::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Critical => "critical",
            Health::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error message with the time it was recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedError {
    pub at: SystemTime,
    pub message: String,
}

/// Attempt statistics of one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySnapshot {
    pub name: String,
    pub attempts: u64,
    pub successes: u64,
    pub retryable_failures: u64,
    pub terminal_failures: u64,
    pub total_attempt_time: Duration,
    pub max_attempt_time: Duration,
    /// Oldest first.
    pub recent_errors: Vec<RecordedError>,
}

impl StrategySnapshot {
    pub fn failures(&self) -> u64 {
        self.retryable_failures + self.terminal_failures
    }

    /// Fraction of attempts that succeeded, `None` before the first attempt.
    pub fn success_rate(&self) -> Option<f64> {
        ratio(self.successes, self.attempts)
    }

    pub fn health(&self) -> Health {
        Health::from_success_rate(self.success_rate())
    }

    pub fn average_attempt_time(&self) -> Option<Duration> {
        average(self.total_attempt_time, self.attempts)
    }
}

/// Request outcomes for one platform.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformSnapshot {
    pub platform: Platform,
    pub succeeded: u64,
    pub failed: u64,
    /// Summed over successful requests only.
    pub total_download_time: Duration,
    pub max_download_time: Duration,
}

impl PlatformSnapshot {
    pub fn success_rate(&self) -> Option<f64> {
        ratio(self.succeeded, self.succeeded + self.failed)
    }

    pub fn health(&self) -> Health {
        Health::from_success_rate(self.success_rate())
    }

    /// Mean wall time of a successful request.
    pub fn average_download_time(&self) -> Option<Duration> {
        average(self.total_download_time, self.succeeded)
    }
}

/// Copy of every engine counter at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    pub uptime: Duration,
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    /// Turned away by admission; not counted in `requests_started`.
    pub requests_rejected: u64,
    pub bytes_delivered: u64,
    pub strategies: Vec<StrategySnapshot>,
    pub platforms: Vec<PlatformSnapshot>,
}

impl TelemetrySnapshot {
    pub fn strategy(&self, name: &str) -> Option<&StrategySnapshot> {
        self.strategies.iter().find(|s| s.name == name)
    }

    pub fn platform(&self, platform: Platform) -> Option<&PlatformSnapshot> {
        self.platforms.iter().find(|p| p.platform == platform)
    }

    /// Requests admitted but not yet finished.
    pub fn requests_active(&self) -> u64 {
        self.requests_started
            .saturating_sub(self.requests_succeeded)
            .saturating_sub(self.requests_failed)
    }

    /// Total strategy attempts across the chain.
    pub fn total_attempts(&self) -> u64 {
        self.strategies.iter().map(|s| s.attempts).sum()
    }
}

fn ratio(part: u64, whole: u64) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64)
}

fn average(total: Duration, count: u64) -> Option<Duration> {
    u32::try_from(count)
        .ok()
        .filter(|&n| n > 0)
        .map(|n| total / n)
}
