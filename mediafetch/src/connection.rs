//! Reconnect handling for long-lived client connections.
//!
//! The delivery layer keeps clients (for example a large-file transfer
//! channel) alive for the whole process. [`PersistentConnectionManager`]
//! wraps their connect and call operations with the shared backoff policy
//! and spaces out reconnects so a flapping remote is not hammered.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{ConnectionError, ErrorClass, FetchError};
use crate::retry::{CallClass, RetryPolicy};

/// Default cap on attempts per operation.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

/// Default cap on the delay between reconnect attempts (30 seconds).
pub const DEFAULT_RECONNECT_CAP_SECS: u64 = 30;

/// Default minimum spacing after a successful connect (3 seconds).
pub const DEFAULT_MIN_RECONNECT_INTERVAL_SECS: u64 = 3;

/// Reconnect tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Backoff between attempts; the metadata cap applies.
    pub policy: RetryPolicy,
    /// Minimum time after a successful connect before the next one starts.
    pub min_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            policy: RetryPolicy::default()
                .with_metadata_cap(Duration::from_secs(DEFAULT_RECONNECT_CAP_SECS)),
            min_interval: Duration::from_secs(DEFAULT_MIN_RECONNECT_INTERVAL_SECS),
        }
    }
}

/// Backoff wrapper and named registry for long-lived clients.
pub struct PersistentConnectionManager {
    config: ConnectionConfig,
    last_success: Mutex<Option<Instant>>,
    clients: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for PersistentConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnectionManager")
            .field("config", &self.config)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl Default for PersistentConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl PersistentConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: ConnectionConfig {
                max_attempts: config.max_attempts.max(1),
                ..config
            },
            last_success: Mutex::new(None),
            clients: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Runs `op` until it succeeds, fails terminally, or the attempt budget
    /// is spent.
    ///
    /// Before every attempt, waits out whatever remains of the minimum
    /// interval since the last successful operation.
    pub async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ConnectionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.config.max_attempts;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            self.wait_min_interval().await;

            match op(attempt).await {
                Ok(value) => {
                    *self.last_success.lock() = Some(Instant::now());
                    if attempt > 0 {
                        tracing::info!(attempt, "Connection re-established");
                    }
                    return Ok(value);
                }
                Err(e) if RetryPolicy::classify(&e) == ErrorClass::Terminal => {
                    tracing::error!(attempt, error = %e, "Connection failed permanently");
                    return Err(ConnectionError::Fatal(e.to_string()));
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < max_attempts {
                        let delay = self.config.policy.next_delay(attempt, CallClass::Metadata);
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Connection attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(attempts = max_attempts, error = %last_error, "Giving up on connection");
        Err(ConnectionError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn wait_min_interval(&self) {
        let last = *self.last_success.lock();
        if let Some(last) = last {
            let ready_at = last + self.config.min_interval;
            if ready_at > Instant::now() {
                tracing::debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "Spacing out reconnect"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }

    /// Time of the last successful operation.
    pub fn last_success(&self) -> Option<Instant> {
        *self.last_success.lock()
    }

    /// Stores a client handle under `name`, replacing any previous one.
    pub fn register_client<T>(&self, name: impl Into<String>, client: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let name = name.into();
        tracing::debug!(client = %name, "Registered client");
        self.clients.insert(name, client);
    }

    /// The client registered as `name`, if it has type `T`.
    pub fn client<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let handle = Arc::clone(self.clients.get(name)?.value());
        handle.downcast::<T>().ok()
    }

    /// Removes and returns whether a client was registered as `name`.
    pub fn remove_client(&self, name: &str) -> bool {
        self.clients.remove(name).is_some()
    }

    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
