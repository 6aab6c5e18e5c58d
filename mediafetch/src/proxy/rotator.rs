//! Round-robin proxy selection with a per-endpoint circuit breaker.
//!
//! # State Machine (per endpoint)
//!
//! ```text
//! Healthy --[K consecutive failures]--> CoolingDown(until = now + cooldown)
//! CoolingDown --[failure]--> CoolingDown(until extended, never shortened)
//! CoolingDown --[now >= until]--> eligible for selection again
//! any --[success]--> Healthy (failures = 0, cooldown cleared)
//! ```
//!
//! # Thread Safety
//!
//! All health state sits behind one `parking_lot::Mutex`, held only for
//! bookkeeping. `select()` hands out an `Arc` snapshot of the endpoint so no
//! lock is held across network I/O.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::ProxyEndpoint;
use crate::error::{ErrorClass, FetchError};
use crate::retry::RetryPolicy;

/// Default consecutive failures before an endpoint cools down.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default cooldown after tripping (60 seconds).
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;

/// Configuration for the proxy rotator.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRotatorConfig {
    /// Consecutive failures that trip an endpoint (default: 3).
    pub failure_threshold: u32,
    /// How long a tripped endpoint is skipped (default: 60s).
    pub cooldown: Duration,
}

impl Default for ProxyRotatorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        }
    }
}

/// Point-in-time health of one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub endpoint: Arc<ProxyEndpoint>,
    pub consecutive_failures: u32,
    /// Remaining cooldown, zero when selectable.
    pub cooldown_remaining: Duration,
}

#[derive(Debug)]
struct EndpointHealth {
    endpoint: Arc<ProxyEndpoint>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl EndpointHealth {
    fn is_available(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| until <= now)
    }
}

#[derive(Debug)]
struct RotatorInner {
    entries: Vec<EndpointHealth>,
    cursor: usize,
}

/// Pool of outbound proxies with health tracking.
#[derive(Debug)]
pub struct ProxyRotator {
    config: ProxyRotatorConfig,
    inner: Mutex<RotatorInner>,
}

impl ProxyRotator {
    /// Creates a rotator. Duplicate endpoints (same `host:port`) are collapsed.
    pub fn new(endpoints: Vec<ProxyEndpoint>, config: ProxyRotatorConfig) -> Self {
        let mut entries: Vec<EndpointHealth> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if entries.iter().any(|e| e.endpoint.key() == endpoint.key()) {
                continue;
            }
            entries.push(EndpointHealth {
                endpoint: Arc::new(endpoint),
                consecutive_failures: 0,
                cooldown_until: None,
            });
        }

        tracing::info!(
            endpoints = entries.len(),
            failure_threshold = config.failure_threshold,
            cooldown_secs = config.cooldown.as_secs(),
            "Proxy rotator created"
        );

        Self {
            config,
            inner: Mutex::new(RotatorInner { entries, cursor: 0 }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the next endpoint.
    ///
    /// Round-robin over endpoints that are not cooling down. When every
    /// endpoint is cooling down, returns the one whose cooldown ends first
    /// instead of blocking. `None` only for an empty pool.
    pub fn select(&self) -> Option<Arc<ProxyEndpoint>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let len = inner.entries.len();
        if len == 0 {
            return None;
        }

        let start = inner.cursor % len;
        let available = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| inner.entries[idx].is_available(now));

        let idx = match available {
            Some(idx) => idx,
            None => {
                let (idx, _) = inner
                    .entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.cooldown_until)?;
                tracing::debug!(
                    proxy = %inner.entries[idx].endpoint,
                    "All proxies cooling down, using soonest to recover"
                );
                idx
            }
        };

        inner.cursor = (idx + 1) % len;
        Some(Arc::clone(&inner.entries[idx].endpoint))
    }

    /// Records the outcome of a request made through `endpoint`.
    pub fn report_outcome(&self, endpoint: &ProxyEndpoint, success: bool) {
        let now = Instant::now();
        let key = endpoint.key();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.iter_mut().find(|e| e.endpoint.key() == key) else {
            return;
        };

        if success {
            if entry.consecutive_failures > 0 || entry.cooldown_until.is_some() {
                tracing::debug!(proxy = %entry.endpoint, "Proxy recovered");
            }
            entry.consecutive_failures = 0;
            entry.cooldown_until = None;
            return;
        }

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.consecutive_failures >= self.config.failure_threshold {
            let until = now + self.config.cooldown;
            let extended = entry.cooldown_until.map_or(until, |cur| cur.max(until));
            if entry.cooldown_until.is_none() {
                tracing::warn!(
                    proxy = %entry.endpoint,
                    failures = entry.consecutive_failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Proxy tripped, cooling down"
                );
            }
            entry.cooldown_until = Some(extended);
        }
    }

    /// Records a request outcome from its error, if any.
    ///
    /// Retryable (network-level) errors and access denials count against
    /// the proxy, since platforms block by egress address. Other terminal
    /// answers such as 404 prove the proxy itself works.
    pub fn report_result<T>(&self, endpoint: &ProxyEndpoint, result: &Result<T, FetchError>) {
        let success = match result {
            Ok(_) => true,
            Err(FetchError::AuthOrAccessDenied(_)) => false,
            Err(e) => RetryPolicy::classify(e) == ErrorClass::Terminal,
        };
        self.report_outcome(endpoint, success);
    }

    /// Snapshot of every endpoint's health.
    pub fn status(&self) -> Vec<EndpointStatus> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| EndpointStatus {
                endpoint: Arc::clone(&e.endpoint),
                consecutive_failures: e.consecutive_failures,
                cooldown_remaining: e
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyScheme;

    fn endpoint(n: u16) -> ProxyEndpoint {
        ProxyEndpoint::new(ProxyScheme::Socks5, format!("10.0.0.{}", n), 1080)
    }

    fn rotator(n: u16) -> ProxyRotator {
        ProxyRotator::new((1..=n).map(endpoint).collect(), ProxyRotatorConfig::default())
    }

    #[test]
    fn test_empty_pool_selects_nothing() {
        let r = ProxyRotator::new(vec![], ProxyRotatorConfig::default());
        assert!(r.is_empty());
        assert!(r.select().is_none());
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let r = ProxyRotator::new(vec![endpoint(1), endpoint(1), endpoint(2)], Default::default());
        assert_eq!(r.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_order() {
        let r = rotator(3);
        let picks: Vec<String> = (0..6).map(|_| r.select().unwrap().address.clone()).collect();
        assert_eq!(
            picks,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tripped_endpoint_is_skipped_until_cooldown_passes() {
        let r = rotator(2);
        let bad = endpoint(1);
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            r.report_outcome(&bad, false);
        }

        for _ in 0..10 {
            assert_eq!(r.select().unwrap().address, "10.0.0.2");
        }

        tokio::time::advance(Duration::from_secs(DEFAULT_COOLDOWN_SECS + 1)).await;
        let picks: Vec<String> = (0..2).map(|_| r.select().unwrap().address.clone()).collect();
        assert!(picks.contains(&"10.0.0.1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_threshold_does_not_trip() {
        let r = rotator(1);
        let e = endpoint(1);
        r.report_outcome(&e, false);
        r.report_outcome(&e, false);
        let status = &r.status()[0];
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.cooldown_remaining, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures_and_cooldown() {
        let r = rotator(1);
        let e = endpoint(1);
        for _ in 0..5 {
            r.report_outcome(&e, false);
        }
        assert!(r.status()[0].cooldown_remaining > Duration::ZERO);

        r.report_outcome(&e, true);
        let status = &r.status()[0];
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.cooldown_remaining, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_cooling_picks_soonest_recovery() {
        let r = rotator(2);
        let first = endpoint(1);
        let second = endpoint(2);

        for _ in 0..3 {
            r.report_outcome(&first, false);
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..3 {
            r.report_outcome(&second, false);
        }

        // first trips 10s earlier, so it recovers first
        assert_eq!(r.select().unwrap().address, "10.0.0.1");
        assert_eq!(r.select().unwrap().address, "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_never_shrinks_while_failing() {
        let r = rotator(1);
        let e = endpoint(1);
        for _ in 0..3 {
            r.report_outcome(&e, false);
        }
        let before = r.status()[0].cooldown_remaining;

        tokio::time::advance(Duration::from_secs(5)).await;
        r.report_outcome(&e, false);
        let after = r.status()[0].cooldown_remaining;

        assert!(after >= before - Duration::from_secs(5));
        assert_eq!(after, Duration::from_secs(DEFAULT_COOLDOWN_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_do_not_count_against_proxy() {
        let r = rotator(1);
        let e = endpoint(1);
        for _ in 0..5 {
            r.report_result::<()>(&e, &Err(FetchError::NotFound("404".into())));
        }
        assert_eq!(r.status()[0].consecutive_failures, 0);

        for _ in 0..3 {
            r.report_result::<()>(&e, &Err(FetchError::NetworkTransient("reset".into())));
        }
        assert_eq!(r.status()[0].consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_denied_counts_against_proxy() {
        let r = rotator(1);
        let e = endpoint(1);
        r.report_result::<()>(&e, &Err(FetchError::AuthOrAccessDenied("403".into())));
        assert_eq!(r.status()[0].consecutive_failures, 1);
    }
}
