//! Mediafetch - fallback-chain media acquisition engine
//!
//! Given a URL pointing at a video on a social platform, the engine picks the
//! platform's chain of source strategies, runs them one after another with
//! classified retries and rotating proxies, and leaves exactly one complete
//! file in the staging directory for the caller to deliver.
//!
//! # Components
//!
//! - [`retry`] - backoff policy and the retryable/terminal error table
//! - [`proxy`] - round-robin proxy pool with failure cooldown
//! - [`strategy`] - extractor, scraper and direct-download strategies
//! - [`registry`] - per-platform strategy chains
//! - [`lifecycle`] - staged files, promotion and TTL cleanup
//! - [`admission`] - global concurrency and per-requester limits
//! - [`orchestrator`] - runs a request through its chain
//! - [`connection`] - reconnect backoff for long-lived clients
//! - [`telemetry`] - per-strategy and per-platform counters
//! - [`engine`] - wires everything together from an [`EngineConfig`]

pub mod admission;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod platform;
pub mod proxy;
pub mod registry;
pub mod retry;
pub mod strategy;
pub mod telemetry;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionTicket, Rejection};
pub use config::EngineConfig;
pub use connection::{ConnectionConfig, PersistentConnectionManager};
pub use engine::MediaEngine;
pub use error::{
    AggregateFailure, ConfigError, ConnectionError, EngineError, ErrorClass, FetchError,
    LifecycleError,
};
pub use lifecycle::{FileId, FileLifecycleConfig, FileLifecycleManager, FileRecord};
pub use logging::{init_logging, LoggingConfig, LoggingGuard};
pub use model::{
    AttemptOutcome, DownloadRequest, DownloadResult, EventSink, FetchEvent, RequestId,
    SourceAttempt,
};
pub use orchestrator::{DownloadOrchestrator, OrchestratorConfig};
pub use platform::Platform;
pub use proxy::{ProxyEndpoint, ProxyRotator, ProxyRotatorConfig};
pub use registry::StrategyRegistry;
pub use retry::{CallClass, RetryPolicy};
pub use strategy::SourceStrategy;
pub use telemetry::{EngineMetrics, Health, TelemetrySnapshot};
