use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::orchestrator::SessionOrchestrator;

/// Periodically caches a snapshot of the active envelope so that a process
/// killed without a clean shutdown still leaves recent data on disk.
pub struct PeriodicCacher {
    task: JoinHandle<()>,
}

impl PeriodicCacher {
    pub fn start(orchestrator: Arc<SessionOrchestrator>, interval: Duration, runtime: &Handle) -> Self {
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip first immediate tick

            loop {
                ticker.tick().await;
                if !orchestrator.cache_active_snapshot() {
                    log::trace!("[ORCHESTRATOR] No active envelope to cache");
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PeriodicCacher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
