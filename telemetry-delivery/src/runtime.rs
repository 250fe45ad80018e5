//! Wiring of stores, delivery and orchestration into one running core.

use std::sync::Arc;
use std::time::Duration;
use telemetry_types::ProcessState;
use tokio::runtime::Handle;

use crate::clock::{Clock, SystemClock};
use crate::config::DeliveryConfig;
use crate::delivery::{
    DeliveryParts, DeliveryService, HttpTransport, RateLimitHandler, RetryQueue, Transport, TransportError, WorkerPool,
};
use crate::diagnostics::{DiagnosticsSink, LogDiagnostics};
use crate::session::{
    BoundaryDelegate, EnvelopeBuilder, OrchestratorParts, PeriodicCacher, SessionOrchestrator, SessionProperties,
};
use crate::storage::PayloadStore;

/// Errors raised while starting the core.
#[derive(Debug)]
pub enum CoreError {
    /// The default HTTP transport could not be created
    Transport(TransportError),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Transport(e) => write!(f, "failed to create transport: {}", e),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Transport(e) => Some(e),
        }
    }
}

/// Pluggable collaborators. Only the envelope builder is required.
pub struct CoreCollaborators {
    builder: Arc<dyn EnvelopeBuilder>,
    transport: Option<Arc<dyn Transport>>,
    boundary: Option<Arc<dyn BoundaryDelegate>>,
    clock: Option<Arc<dyn Clock>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl CoreCollaborators {
    pub fn new(builder: Arc<dyn EnvelopeBuilder>) -> Self {
        Self {
            builder,
            transport: None,
            boundary: None,
            clock: None,
            diagnostics: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_boundary(mut self, boundary: Arc<dyn BoundaryDelegate>) -> Self {
        self.boundary = Some(boundary);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

/// The running telemetry core.
pub struct TelemetryCore {
    orchestrator: Arc<SessionOrchestrator>,
    delivery: DeliveryService,
    properties: Option<Arc<SessionProperties>>,
    cacher: PeriodicCacher,
}

impl TelemetryCore {
    /// Build and start the core on the current Tokio runtime.
    ///
    /// Pending deliveries and snapshots left by a previous process are
    /// reloaded and queued before the first envelope starts, and a flush is
    /// scheduled in the background.
    pub async fn start(
        config: DeliveryConfig,
        collaborators: CoreCollaborators,
        initial_state: ProcessState,
    ) -> Result<Self, CoreError> {
        let runtime = Handle::current();
        let diagnostics = collaborators
            .diagnostics
            .unwrap_or_else(|| Arc::new(LogDiagnostics) as Arc<dyn DiagnosticsSink>);
        let clock = collaborators
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let transport: Arc<dyn Transport> = match collaborators.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(&config.base_url, Duration::from_secs(config.request_timeout_secs))
                    .map_err(CoreError::Transport)?,
            ),
        };
        let (boundary, properties): (Arc<dyn BoundaryDelegate>, Option<Arc<SessionProperties>>) =
            match collaborators.boundary {
                Some(boundary) => (boundary, None),
                None => {
                    let properties = Arc::new(SessionProperties::default());
                    (properties.clone() as Arc<dyn BoundaryDelegate>, Some(properties))
                }
            };

        let pending_store = Arc::new(PayloadStore::new(
            config.pending_dir(),
            config.max_stored_payloads,
            diagnostics.clone(),
        ));
        let snapshot_store = Arc::new(PayloadStore::new(
            config.snapshot_dir(),
            config.max_cached_snapshots,
            diagnostics.clone(),
        ));
        let queue = RetryQueue::new(pending_store, diagnostics.clone());
        let workers = WorkerPool::new(runtime.clone(), config.worker_threads);

        let reload_queue = queue.clone();
        let reloaded = workers
            .run_blocking(move || reload_queue.load_from_disk())
            .await
            .unwrap_or_default();

        let delivery = DeliveryService::new(
            config.clone(),
            DeliveryParts {
                transport,
                queue,
                snapshots: snapshot_store,
                rate_limiter: RateLimitHandler::new(clock.clone(), &config),
                workers: workers.clone(),
                clock: clock.clone(),
                diagnostics: diagnostics.clone(),
            },
        );
        let resurrected = delivery.resurrect_cached_snapshots().await;

        let orchestrator = Arc::new(SessionOrchestrator::new(
            OrchestratorParts {
                builder: collaborators.builder,
                delivery: Arc::new(delivery.clone()),
                boundary,
                clock,
                diagnostics,
            },
            &config,
            initial_state,
        ));
        let cacher = PeriodicCacher::start(
            orchestrator.clone(),
            Duration::from_millis(config.periodic_cache_interval_ms),
            &runtime,
        );

        let flusher = delivery.clone();
        workers.spawn(async move {
            flusher.flush_queue_on_reconnect().await;
        });

        log::info!(
            "[TELEMETRY] Core started in {} ({} pending, {} resurrected, storage {})",
            initial_state,
            reloaded,
            resurrected,
            config.storage_dir.display()
        );

        Ok(Self {
            orchestrator,
            delivery,
            properties,
            cacher,
        })
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    pub fn delivery(&self) -> &DeliveryService {
        &self.delivery
    }

    /// Built-in session properties, when no custom boundary delegate was given.
    pub fn session_properties(&self) -> Option<&Arc<SessionProperties>> {
        self.properties.as_ref()
    }

    /// Stop periodic caching. Queued deliveries stay on disk for the next start.
    pub fn shutdown(&self) {
        self.cacher.stop();
        log::info!("[TELEMETRY] Core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryEvent, NetworkStatus};
    use crate::testing::{FakeClock, FakeEnvelopeBuilder, RecordingDiagnostics, ScriptedTransport, init_logging};
    use telemetry_types::Endpoint;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> DeliveryConfig {
        DeliveryConfig {
            storage_dir: dir.path().to_path_buf(),
            periodic_cache_interval_ms: 60_000,
            ..Default::default()
        }
    }

    async fn start(dir: &TempDir, transport: Arc<ScriptedTransport>) -> TelemetryCore {
        init_logging();
        let collaborators = CoreCollaborators::new(Arc::new(FakeEnvelopeBuilder::default()))
            .with_transport(transport)
            .with_clock(Arc::new(FakeClock::new(0)))
            .with_diagnostics(Arc::new(RecordingDiagnostics::default()));
        TelemetryCore::start(config_in(dir), collaborators, ProcessState::Foreground)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_is_delivered_after_backgrounding() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let core = start(&dir, transport.clone()).await;
        let mut events = core.delivery().subscribe();

        assert_eq!(
            core.orchestrator().active_envelope().map(|e| e.id.clone()).as_deref(),
            Some("session-1")
        );
        core.orchestrator().on_background(1000);

        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(DeliveryEvent::Delivered { endpoint, .. }) = events.recv().await {
                    return endpoint;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(delivered, Endpoint::Sessions);
        assert_eq!(transport.posts(), vec![(Endpoint::Sessions, b"session-1".to_vec())]);
        assert!(core.session_properties().is_some());
        core.shutdown();
    }

    #[tokio::test]
    async fn test_restart_delivers_what_the_previous_run_left() {
        let dir = TempDir::new().unwrap();
        {
            let core = start(&dir, Arc::new(ScriptedTransport::new())).await;
            core.delivery().on_network_status_changed(NetworkStatus::NotReachable);
            core.orchestrator().cache_active_snapshot();
            core.orchestrator().end_with_crash("crash-1");
            assert_eq!(core.delivery().queue().len(), 1);
            core.shutdown();
        }

        let transport = Arc::new(ScriptedTransport::new());
        let core = start(&dir, transport.clone()).await;
        // the startup flush runs in the background
        tokio::time::timeout(Duration::from_secs(5), async {
            while !core.delivery().queue().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(transport.posts().contains(&(Endpoint::Sessions, b"session-1".to_vec())));
    }
}
