//! Engine assembly and lifecycle.
//!
//! [`MediaEngine`] wires the components together from an [`EngineConfig`]
//! and owns the background work they need.
//!
//! # Startup Sequence
//!
//! 1. HTTP transport and proxy pool are built
//! 2. Standard strategy chains are registered
//! 3. `start` creates the staging directory and launches the file sweeper
//!
//! # Example
//!
//! ```ignore
//! use mediafetch::{DownloadRequest, EngineConfig, MediaEngine};
//!
//! let mut engine = MediaEngine::from_config(EngineConfig::default())?;
//! engine.start().await?;
//!
//! let result = engine
//!     .fetch(DownloadRequest::new("https://youtu.be/abc", "user-42"))
//!     .await?;
//! // deliver result.final_path, then
//! engine.release(result.file_id).await;
//!
//! engine.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::AdmissionController;
use crate::config::EngineConfig;
use crate::connection::PersistentConnectionManager;
use crate::error::{EngineError, FetchError};
use crate::lifecycle::{FileId, FileLifecycleManager};
use crate::model::{DownloadRequest, DownloadResult, EventSink};
use crate::orchestrator::DownloadOrchestrator;
use crate::proxy::ProxyRotator;
use crate::registry::StrategyRegistry;
use crate::strategy::HttpTransport;
use crate::telemetry::TelemetrySnapshot;

/// A fully wired acquisition engine.
pub struct MediaEngine {
    orchestrator: Arc<DownloadOrchestrator>,
    connections: Arc<PersistentConnectionManager>,
    proxies: Option<Arc<ProxyRotator>>,
    sweeper: Option<JoinHandle<()>>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for MediaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaEngine")
            .field("orchestrator", &self.orchestrator)
            .field("proxies", &self.proxies.as_ref().map(|p| p.len()))
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl MediaEngine {
    /// Builds the engine with the standard strategy chains.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let transport =
            Arc::new(HttpTransport::new(config.transport.clone()).map_err(EngineError::Transport)?);

        let proxies = if config.proxy.endpoints.is_empty() {
            None
        } else {
            Some(Arc::new(ProxyRotator::new(
                config.proxy.endpoints.clone(),
                config.proxy.rotator.clone(),
            )))
        };

        let registry = StrategyRegistry::standard(
            transport,
            proxies.clone(),
            &config.scraper,
            &config.extractor,
        );

        let mut engine = Self::with_registry(config, registry);
        engine.proxies = proxies;
        Ok(engine)
    }

    /// Builds the engine around a caller-supplied registry.
    pub fn with_registry(config: EngineConfig, registry: StrategyRegistry) -> Self {
        let admission = Arc::new(AdmissionController::new(config.admission));
        let files = Arc::new(FileLifecycleManager::new(config.files));
        let orchestrator = Arc::new(DownloadOrchestrator::new(
            Arc::new(registry),
            admission,
            files,
            config.orchestrator,
        ));

        Self {
            orchestrator,
            connections: Arc::new(PersistentConnectionManager::new(config.connection)),
            proxies: None,
            sweeper: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Prepares the staging directory and starts the periodic sweeper.
    ///
    /// Calling `start` on a running engine is a no-op.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.is_running() {
            return Ok(());
        }

        let files = self.orchestrator.files();
        files.prepare().await?;

        let leftovers = files.sweep_expired().await;
        if leftovers.total() > 0 {
            info!(
                expired = leftovers.expired,
                orphans = leftovers.orphans,
                "Removed leftovers from a previous run"
            );
        }

        self.sweeper = Some(files.spawn_sweeper(self.cancellation.child_token()));
        info!(
            staging_dir = %files.staging_dir().display(),
            max_concurrent = self.orchestrator.admission().config().max_concurrent,
            proxies = self.proxies.as_ref().map_or(0, |p| p.len()),
            "Media engine started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.is_some()
    }

    pub fn orchestrator(&self) -> &Arc<DownloadOrchestrator> {
        &self.orchestrator
    }

    pub fn connections(&self) -> &Arc<PersistentConnectionManager> {
        &self.connections
    }

    pub fn proxies(&self) -> Option<&Arc<ProxyRotator>> {
        self.proxies.as_ref()
    }

    /// Current request and strategy counters.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.orchestrator.metrics().snapshot()
    }

    /// Shorthand for [`DownloadOrchestrator::fetch`].
    pub async fn fetch(&self, request: DownloadRequest) -> Result<DownloadResult, FetchError> {
        self.orchestrator.fetch(request).await
    }

    /// Shorthand for [`DownloadOrchestrator::fetch_with_events`].
    pub async fn fetch_with_events(
        &self,
        request: DownloadRequest,
        events: EventSink,
    ) -> Result<DownloadResult, FetchError> {
        self.orchestrator.fetch_with_events(request, events).await
    }

    /// Shorthand for [`DownloadOrchestrator::release`].
    pub async fn release(&self, file_id: FileId) -> bool {
        self.orchestrator.release(file_id).await
    }

    /// Stops the sweeper and deletes every file still tracked.
    ///
    /// Returns the number of files released.
    pub async fn shutdown(mut self) -> usize {
        info!("Media engine shutting down");
        self.cancellation.cancel();

        if let Some(handle) = self.sweeper.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "File sweeper task ended abnormally");
            }
        }

        let released = self.orchestrator.files().release_all().await;
        let stats = self.telemetry();
        info!(
            released,
            requests = stats.requests_started,
            succeeded = stats.requests_succeeded,
            failed = stats.requests_failed,
            rejected = stats.requests_rejected,
            attempts = stats.total_attempts(),
            "Media engine stopped"
        );
        released
    }
}
